//! HTTP handlers for the upload, list, reset and presign endpoints.
//! Request framing lives here; every decision is delegated to `FileService`.

use crate::{
    errors::AppError,
    models::{DerivedFile, FileView},
    services::file_service::{FileService, ValidationError},
};
use axum::{
    Json,
    extract::{
        Multipart, State,
        multipart::MultipartRejection,
        rejection::JsonRejection,
    },
    http::{Method, Uri},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Multipart field that carries the uploaded file.
const FILE_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PresignResponse {
    #[serde(rename = "preSignedUrl")]
    pub pre_signed_url: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    pub files: Vec<DerivedFile>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// `POST /generate-presigned-url`: `{fileName}` in, `{preSignedUrl}` out.
pub async fn generate_presigned_url(
    State(service): State<FileService>,
    payload: Result<Json<PresignRequest>, JsonRejection>,
) -> Result<Json<PresignResponse>, AppError> {
    // an unreadable body carries no file name either
    let file_name = payload.ok().and_then(|Json(req)| req.file_name);
    let pre_signed_url = service.presign(file_name.as_deref()).await?;
    Ok(Json(PresignResponse { pre_signed_url }))
}

/// `POST /upload`: multipart with a `file` field.
pub async fn upload_file(
    State(service): State<FileService>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    info!("Upload request received");
    let (name, content) = match multipart {
        Ok(multipart) => read_file_field(multipart).await?,
        Err(rejection) => {
            debug!(%rejection, "upload request is not multipart");
            return Err(ValidationError::MissingFile.into());
        }
    };

    let files = service.upload(name.as_deref(), content).await?;
    Ok(Json(UploadResponse {
        message: "File uploaded and processed successfully",
        files,
    }))
}

/// Pull the file name and bytes out of the first `file` field, if any.
async fn read_file_field(
    mut multipart: Multipart,
) -> Result<(Option<String>, Option<Bytes>), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::new(err.status(), err.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let name = field.file_name().map(str::to_string);
        let content = field
            .bytes()
            .await
            .map_err(|err| AppError::new(err.status(), err.body_text()))?;
        debug!(name = ?name, size = content.len(), "file field received");
        return Ok((name, Some(content)));
    }
    Ok((None, None))
}

/// `GET /files`: registry contents, newest first.
pub async fn list_files(
    State(service): State<FileService>,
) -> Result<Json<Vec<FileView>>, AppError> {
    let files = service.list().await?;
    info!(count = files.len(), "Returning files");
    Ok(Json(files))
}

/// `POST /reset-files`: clear the registry and the bucket.
pub async fn reset_files(
    State(service): State<FileService>,
) -> Result<Json<MessageResponse>, AppError> {
    service.reset().await?;
    Ok(Json(MessageResponse {
        message: "Files table and storage bucket reset successfully",
    }))
}

/// `POST /sync-files`: re-list the bucket and reconcile without uploading.
pub async fn sync_files(
    State(service): State<FileService>,
) -> Result<Json<UploadResponse>, AppError> {
    let files = service.resync().await?;
    Ok(Json(UploadResponse {
        message: "Files synchronized successfully",
        files,
    }))
}

pub async fn route_not_found(method: Method, uri: Uri) -> AppError {
    info!("404: {} {}", method, uri);
    AppError::not_found("Route not found")
}
