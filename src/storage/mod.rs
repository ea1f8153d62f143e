//! Blob Store Gateway.
//!
//! A uniform interface over the object store that holds uploaded files.
//! Two backends are provided: [`LocalBlobStore`] keeps payloads on disk and
//! [`S3BlobStore`] talks to any S3-compatible service.

pub mod local;
pub mod s3;

use crate::models::StoredObject;
use async_trait::async_trait;
use bytes::Bytes;
use std::{future::Future, io, time::Duration};
use thiserror::Error;

pub use local::LocalBlobStore;
pub use s3::S3BlobStore;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Maximum lifetime of a signed write URL (SigV4 limit).
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key `{key}`: {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("{op} failed: {message}")]
    Backend { op: &'static str, message: String },
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("deleted {deleted} objects but failed to delete {}: {}", failed.len(), failed.join(", "))]
    PartialDelete { deleted: usize, failed: Vec<String> },
    #[error("presign failed: {0}")]
    Presign(String),
    #[error("unsupported by this backend: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn backend(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            op,
            message: err.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Operations every object-store backend provides.
///
/// Listings may lag behind writes; callers must not assume a just-written
/// object is visible to the next `list_all`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Name of the bucket this gateway is bound to.
    fn bucket(&self) -> &str;

    /// Write `content` under `name`, replacing any existing object.
    async fn put(&self, name: &str, content: Bytes) -> StoreResult<()>;

    /// Every object currently visible in the bucket.
    async fn list_all(&self) -> StoreResult<Vec<StoredObject>>;

    /// Remove one object. Removing a missing object is not an error.
    async fn delete(&self, name: &str) -> StoreResult<()>;

    /// Remove every listed object and return how many were deleted.
    ///
    /// If some deletions fail, returns [`StoreError::PartialDelete`].
    async fn delete_all(&self) -> StoreResult<usize>;

    /// Issue a time-limited URL that lets a client PUT `name` directly.
    async fn issue_write_url(
        &self,
        name: &str,
        ttl: Duration,
        content_type: &str,
    ) -> StoreResult<String>;

    /// Cheap reachability check used by `/readyz`.
    async fn check(&self) -> StoreResult<()>;
}

/// Run a store call with an upper bound on its duration.
pub async fn bounded<T, F>(timeout: Duration, op: &'static str, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, after: timeout }),
    }
}

/// Basic key validation to avoid trivial path traversal vectors.
///
/// Rejects empty or oversized keys, keys that begin with `/` or contain
/// `..`, and keys with control characters or backslashes.
pub fn ensure_key_safe(key: &str) -> StoreResult<()> {
    let reject = |reason| {
        Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };
    if key.is_empty() {
        return reject("key is empty");
    }
    if key.len() > MAX_OBJECT_KEY_LEN {
        return reject("key exceeds 1024 bytes");
    }
    if key.starts_with('/') || key.contains("..") {
        return reject("key must be relative and must not contain `..`");
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return reject("key contains control characters or backslashes");
    }
    // every segment must survive a filesystem path round trip unchanged
    if key.split('/').any(|segment| segment.is_empty() || segment == ".") {
        return reject("key must not contain empty or `.` segments or end with `/`");
    }
    Ok(())
}

/// Validate presigned URL expiry duration.
pub fn validate_expiry(ttl: Duration) -> StoreResult<()> {
    if ttl.is_zero() {
        Err(StoreError::Presign(
            "expiry duration must be greater than zero".into(),
        ))
    } else if ttl > MAX_PRESIGN_EXPIRY {
        Err(StoreError::Presign(format!(
            "expiry duration {:?} exceeds maximum allowed {:?}",
            ttl, MAX_PRESIGN_EXPIRY
        )))
    } else {
        Ok(())
    }
}
