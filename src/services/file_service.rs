//! FileService: upload, list, reset and presign operations.
//!
//! Stateless itself: every durable fact lives in the blob store or the
//! registry, and both handles are shared process-wide.

use super::{
    archive,
    sync_service::{Expectation, MetadataSynchronizer, SyncError},
};
use crate::{
    models::{DerivedFile, FileView},
    registry::{self, FileRegistry, RegistryError},
    storage::{self, BlobStore, StoreError},
};
use bytes::Bytes;
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct ServiceSettings {
    /// Upper bound for each store or registry call made directly by the service.
    pub op_timeout: Duration,
    /// Lifetime of issued write URLs.
    pub presign_ttl: Duration,
    /// Content type a presigned upload must declare.
    pub presign_content_type: String,
    /// Replace uploaded `.zip` archives with the files they contain.
    pub unpack_archives: bool,
    /// Cap on the total uncompressed size of one archive's entries.
    pub max_unpacked_bytes: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(30),
            presign_ttl: Duration::from_secs(60 * 60),
            presign_content_type: "application/zip".into(),
            unpack_archives: true,
            max_unpacked_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Request input rejected before touching either store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No file uploaded")]
    MissingFile,
    #[error("File name is required")]
    MissingFileName,
    #[error("Uploaded file is empty")]
    EmptyPayload,
    #[error("Invalid file name `{name}`: {reason}")]
    InvalidFileName { name: String, reason: &'static str },
    #[error("Malformed upload request: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Nothing was written; the store and registry are unchanged.
    #[error("Error uploading file: {0}")]
    BlobWrite(#[source] StoreError),
    /// The archive is stored but some of its entries may be missing.
    #[error("Archive stored but unpacking failed: {0}")]
    Unpack(#[source] StoreError),
    /// The blob is stored but the registry may lag; re-running reconciliation recovers.
    #[error("File stored but metadata sync failed: {0}")]
    MetadataSync(#[source] SyncError),
}

#[derive(Debug, Error)]
pub enum PresignError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A reset where at least one half failed.
#[derive(Debug)]
pub struct ResetError {
    pub registry: Option<RegistryError>,
    pub store: Option<StoreError>,
}

impl fmt::Display for ResetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.registry, &self.store) {
            (Some(db), Some(store)) => write!(
                f,
                "Reset incomplete: files table not cleared ({db}); storage bucket not cleared ({store})"
            ),
            (Some(db), None) => write!(f, "Reset incomplete: files table not cleared ({db})"),
            (None, Some(store)) => {
                write!(f, "Reset incomplete: storage bucket not cleared ({store})")
            }
            (None, None) => write!(f, "Reset incomplete"),
        }
    }
}

impl std::error::Error for ResetError {}

/// Counts from a successful reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSummary {
    pub records_removed: u64,
    pub objects_deleted: usize,
}

/// Readiness of each backing store.
#[derive(Debug)]
pub struct Readiness {
    pub registry: Result<(), String>,
    pub store: Result<(), String>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.registry.is_ok() && self.store.is_ok()
    }
}

#[derive(Clone)]
pub struct FileService {
    store: Arc<dyn BlobStore>,
    registry: Arc<dyn FileRegistry>,
    sync: MetadataSynchronizer,
    settings: ServiceSettings,
}

impl FileService {
    pub fn new(
        store: Arc<dyn BlobStore>,
        registry: Arc<dyn FileRegistry>,
        sync: MetadataSynchronizer,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            registry,
            sync,
            settings,
        }
    }

    /// Store `content` under `name`, then synchronize the registry.
    ///
    /// A readable `.zip` archive is unpacked: its files are stored under their
    /// in-archive paths and the archive itself is removed from the bucket and
    /// the registry. Archives that cannot be read are kept as uploaded.
    ///
    /// Returns every object now in the bucket, numbered in listing order.
    pub async fn upload(
        &self,
        name: Option<&str>,
        content: Option<Bytes>,
    ) -> Result<Vec<DerivedFile>, UploadError> {
        let content = content.ok_or(ValidationError::MissingFile)?;
        let name = validate_name(name)?;
        if content.is_empty() {
            return Err(ValidationError::EmptyPayload.into());
        }

        let size = content.len();
        info!(name, size, bucket = self.store.bucket(), "storing upload");
        storage::bounded(
            self.settings.op_timeout,
            "put",
            self.store.put(name, content.clone()),
        )
        .await
        .map_err(|err| {
            error!(name, error = %err, "blob write failed");
            UploadError::BlobWrite(err)
        })?;

        let expected = if self.settings.unpack_archives && archive::is_archive(name) {
            self.unpack(name, content).await?
        } else {
            Expectation::written(name)
        };

        info!(name, "upload stored, synchronizing metadata");
        self.sync.synchronize(&expected).await.map_err(|err| {
            error!(name, error = %err, "metadata sync failed after blob write");
            UploadError::MetadataSync(err)
        })
    }

    /// Store each entry of the archive `name`, then delete the archive.
    ///
    /// Returns what the listing has to show once the store settles.
    async fn unpack(&self, name: &str, content: Bytes) -> Result<Expectation, UploadError> {
        let entries =
            match archive::extract(name, content, self.settings.max_unpacked_bytes).await {
                Ok(entries) if !entries.is_empty() => entries,
                Ok(_) => {
                    info!(name, "archive holds no files, keeping it as uploaded");
                    return Ok(Expectation::written(name));
                }
                Err(err) => {
                    warn!(name, error = %err, "archive not unpacked, keeping it as uploaded");
                    return Ok(Expectation::written(name));
                }
            };

        let mut present = Vec::with_capacity(entries.len());
        for entry in entries {
            storage::bounded(
                self.settings.op_timeout,
                "put",
                self.store.put(&entry.name, entry.content),
            )
            .await
            .map_err(|err| {
                error!(name, entry = %entry.name, error = %err, "storing archive entry failed");
                UploadError::Unpack(err)
            })?;
            present.push(entry.name);
        }

        let absent = match storage::bounded(
            self.settings.op_timeout,
            "delete",
            self.store.delete(name),
        )
        .await
        {
            Ok(()) => vec![name.to_string()],
            Err(err) => {
                warn!(name, error = %err, "could not delete unpacked archive");
                Vec::new()
            }
        };

        info!(name, entries = present.len(), "archive unpacked");
        Ok(Expectation { present, absent })
    }

    /// Registry contents, newest first, with `type` recomputed from each name.
    pub async fn list(&self) -> Result<Vec<FileView>, RegistryError> {
        let rows = registry::bounded(
            self.settings.op_timeout,
            "list_all",
            self.registry.list_all(),
        )
        .await?;
        Ok(rows.into_iter().map(FileView::from).collect())
    }

    /// Clear both the registry and the bucket.
    ///
    /// Both halves are always attempted; if either fails the error names it.
    pub async fn reset(&self) -> Result<ResetSummary, ResetError> {
        let table = registry::bounded(
            self.settings.op_timeout,
            "truncate_all",
            self.registry.truncate_all(),
        )
        .await;
        let bucket = storage::bounded(
            self.settings.op_timeout,
            "delete_all",
            self.store.delete_all(),
        )
        .await;

        match (table, bucket) {
            (Ok(records_removed), Ok(objects_deleted)) => {
                info!(records_removed, objects_deleted, "files table and bucket reset");
                Ok(ResetSummary {
                    records_removed,
                    objects_deleted,
                })
            }
            (table, bucket) => {
                let err = ResetError {
                    registry: table.err(),
                    store: bucket.err(),
                };
                warn!(error = %err, "reset incomplete");
                Err(err)
            }
        }
    }

    /// Issue a signed URL the client can PUT `file_name` to directly.
    pub async fn presign(&self, file_name: Option<&str>) -> Result<String, PresignError> {
        let name = validate_name(file_name)?;
        let url = storage::bounded(
            self.settings.op_timeout,
            "issue_write_url",
            self.store.issue_write_url(
                name,
                self.settings.presign_ttl,
                &self.settings.presign_content_type,
            ),
        )
        .await?;
        info!(name, "issued write URL");
        Ok(url)
    }

    /// Re-list the bucket and reconcile the registry without uploading.
    pub async fn resync(&self) -> Result<Vec<DerivedFile>, SyncError> {
        self.sync.reconcile().await
    }

    pub async fn readiness(&self) -> Readiness {
        let timeout = self.settings.op_timeout;
        let (registry, store) = tokio::join!(
            registry::bounded(timeout, "ping", self.registry.ping()),
            storage::bounded(timeout, "check", self.store.check()),
        );
        Readiness {
            registry: registry.map_err(|e| e.to_string()),
            store: store.map_err(|e| e.to_string()),
        }
    }
}

fn validate_name(name: Option<&str>) -> Result<&str, ValidationError> {
    let name = match name {
        Some(name) if !name.is_empty() => name,
        _ => return Err(ValidationError::MissingFileName),
    };
    storage::ensure_key_safe(name).map_err(|err| match err {
        StoreError::InvalidKey { reason, .. } => ValidationError::InvalidFileName {
            name: name.to_string(),
            reason,
        },
        other => ValidationError::Malformed(other.to_string()),
    })?;
    Ok(name)
}
