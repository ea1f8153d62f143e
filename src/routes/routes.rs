//! Defines the HTTP surface of the service.
//!
//! ## Structure
//! - `POST /generate-presigned-url` - signed URL for a direct client upload
//! - `POST /upload`                 - multipart upload, then metadata sync
//! - `GET  /files`                  - registry contents, newest first
//! - `POST /reset-files`            - clear registry and bucket
//! - `POST /sync-files`             - reconcile registry with the bucket
//! - `GET  /healthz`, `GET /readyz` - liveness and readiness
//!
//! Anything else answers 404.

use crate::{
    handlers::{
        file_handlers::{
            generate_presigned_url, list_files, reset_files, route_not_found, sync_files,
            upload_file,
        },
        health_handlers::{healthz, readyz},
    },
    services::file_service::FileService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router. `max_upload_bytes` bounds every request body, which
/// in practice only matters for `/upload`.
pub fn routes(max_upload_bytes: usize) -> Router<FileService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/generate-presigned-url", post(generate_presigned_url))
        .route("/upload", post(upload_file))
        .route("/files", get(list_files))
        .route("/reset-files", post(reset_files))
        .route("/sync-files", post(sync_files))
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
