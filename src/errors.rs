use crate::services::{
    file_service::{PresignError, ResetError, UploadError, ValidationError},
    sync_service::SyncError,
};
use crate::registry::RegistryError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// An error response: status, a human-readable message, and optionally the
/// pipeline stage that failed plus the underlying cause.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub stage: Option<&'static str>,
    pub details: Option<String>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            stage: None,
            details: None,
        }
    }

    /// Shortcut for a 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn with_stage(mut self, stage: &'static str) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_details(mut self, details: impl fmt::Display) -> Self {
        self.details = Some(details.to_string());
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let Some(stage) = self.stage {
            body["stage"] = json!(stage);
        }
        if let Some(details) = self.details {
            body["details"] = json!(details);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::bad_request(err.to_string())
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(err) => err.into(),
            UploadError::BlobWrite(err) => AppError::internal("Error uploading file")
                .with_stage("blob_write")
                .with_details(err),
            UploadError::Unpack(err) => AppError::internal("Error unpacking archive")
                .with_stage("unpack")
                .with_details(err),
            UploadError::MetadataSync(err) => err.into(),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        AppError::internal("Error processing file")
            .with_stage("metadata_sync")
            .with_details(err)
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        AppError::internal("Server error").with_details(err)
    }
}

impl From<ResetError> for AppError {
    fn from(err: ResetError) -> Self {
        let stage = match (&err.registry, &err.store) {
            (Some(_), Some(_)) => "registry_and_storage",
            (Some(_), None) => "registry",
            _ => "storage",
        };
        AppError::internal(err.to_string()).with_stage(stage)
    }
}

impl From<PresignError> for AppError {
    fn from(err: PresignError) -> Self {
        match err {
            PresignError::Validation(err) => err.into(),
            PresignError::Store(err) => AppError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;

    #[test]
    fn upload_failures_name_their_stage() {
        let write: AppError =
            UploadError::BlobWrite(StoreError::backend("put", "denied")).into();
        assert_eq!(write.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(write.stage, Some("blob_write"));

        let unpack: AppError =
            UploadError::Unpack(StoreError::backend("put", "quota exceeded")).into();
        assert_eq!(unpack.stage, Some("unpack"));
        assert_eq!(unpack.message, "Error unpacking archive");

        let sync: AppError = UploadError::MetadataSync(SyncError::NotVisible {
            missing: vec!["a.zip".into()],
            attempts: 3,
        })
        .into();
        assert_eq!(sync.stage, Some("metadata_sync"));
        assert!(sync.details.unwrap().contains("a.zip"));
    }

    #[test]
    fn registry_failures_are_server_errors() {
        let list: AppError = RegistryError::Sqlx(sqlx::Error::PoolTimedOut).into();
        assert_eq!(list.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(list.message, "Server error");
        assert!(list.stage.is_none());

        let reset: AppError = ResetError {
            registry: Some(RegistryError::Sqlx(sqlx::Error::PoolTimedOut)),
            store: None,
        }
        .into();
        assert_eq!(reset.stage, Some("registry"));
        assert!(reset.message.contains("files table not cleared"));
    }

    #[test]
    fn validation_is_bad_request() {
        let err: AppError = UploadError::Validation(ValidationError::MissingFile).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "No file uploaded");
    }

    #[test]
    fn reset_error_names_failed_half() {
        let err: AppError = ResetError {
            registry: None,
            store: Some(StoreError::PartialDelete {
                deleted: 1,
                failed: vec!["b.zip".into()],
            }),
        }
        .into();
        assert_eq!(err.stage, Some("storage"));
        assert!(err.message.contains("b.zip"));
    }
}
