//! Metadata Synchronizer.
//!
//! After a blob lands in the store this waits for the listing to reflect it,
//! re-lists the whole bucket, derives one record per object and upserts the
//! batch into the registry in a single transaction. Names the caller removed
//! from the bucket are then dropped from the registry. Because every run
//! re-lists the entire bucket, runs are convergent and safe to repeat.

use crate::{
    models::{DerivedFile, FileRecord, StoredObject},
    registry::{self, FileRegistry, RegistryError},
    storage::{self, BlobStore, StoreError},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Timing knobs for the consistency wait.
#[derive(Clone, Debug)]
pub struct SyncSettings {
    /// Unconditional pause between a completed put and the first listing.
    pub settle_delay: Duration,
    /// First delay between listings while the uploaded name is still missing.
    /// Doubles on each retry, capped at 8x.
    pub poll_interval: Duration,
    /// Total listings attempted before giving up.
    pub max_attempts: u32,
    /// Upper bound for each store or registry call.
    pub op_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            max_attempts: 10,
            op_timeout: Duration::from_secs(30),
        }
    }
}

/// What the listing must show before the registry is updated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Expectation {
    /// Names that must be listed.
    pub present: Vec<String>,
    /// Names that must no longer be listed; their registry rows are removed.
    pub absent: Vec<String>,
}

impl Expectation {
    /// Wait for a single written name.
    pub fn written(name: &str) -> Self {
        Self {
            present: vec![name.to_string()],
            absent: Vec::new(),
        }
    }

    /// Names still out of line with `listing`.
    fn unmet(&self, listing: &[StoredObject]) -> Vec<String> {
        let listed = |name: &String| listing.iter().any(|object| &object.name == name);
        self.present
            .iter()
            .filter(|name| !listed(*name))
            .chain(self.absent.iter().filter(|name| listed(*name)))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing the bucket failed: {0}")]
    List(#[source] StoreError),
    #[error("bucket listing still out of date for {missing:?} after {attempts} listings")]
    NotVisible { missing: Vec<String>, attempts: u32 },
    #[error("registry update failed, {} records not committed: {source}", pending.len())]
    Reconcile {
        #[source]
        source: RegistryError,
        /// Names whose registry rows did not reach their reconciled state.
        pending: Vec<String>,
    },
}

#[derive(Clone)]
pub struct MetadataSynchronizer {
    store: Arc<dyn BlobStore>,
    registry: Arc<dyn FileRegistry>,
    settings: SyncSettings,
}

impl MetadataSynchronizer {
    pub fn new(
        store: Arc<dyn BlobStore>,
        registry: Arc<dyn FileRegistry>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    /// Bring the registry in line with the bucket after the writes and
    /// deletions described by `expected`.
    ///
    /// Returns the derived listing, which is the authoritative answer to
    /// "what is stored now".
    pub async fn synchronize(&self, expected: &Expectation) -> Result<Vec<DerivedFile>, SyncError> {
        if !self.settings.settle_delay.is_zero() {
            debug!(delay = ?self.settings.settle_delay, "waiting for store to settle");
            tokio::time::sleep(self.settings.settle_delay).await;
        }
        let listing = self.wait_for(expected).await?;
        let derived = self.apply(listing).await?;
        self.forget(&expected.absent).await?;
        Ok(derived)
    }

    /// Re-list and reconcile immediately, without waiting for any name.
    pub async fn reconcile(&self) -> Result<Vec<DerivedFile>, SyncError> {
        let listing = self.list().await?;
        self.apply(listing).await
    }

    async fn list(&self) -> Result<Vec<StoredObject>, SyncError> {
        storage::bounded(self.settings.op_timeout, "list_all", self.store.list_all())
            .await
            .map_err(SyncError::List)
    }

    /// Poll the listing until it meets `expected` or attempts run out.
    async fn wait_for(&self, expected: &Expectation) -> Result<Vec<StoredObject>, SyncError> {
        let attempts = self.settings.max_attempts.max(1);
        let cap = self.settings.poll_interval * 8;
        let mut backoff = self.settings.poll_interval;
        let mut missing = Vec::new();

        for attempt in 1..=attempts {
            let listing = self.list().await?;
            missing = expected.unmet(&listing);
            if missing.is_empty() {
                debug!(attempt, objects = listing.len(), "listing reflects upload");
                return Ok(listing);
            }
            if attempt < attempts {
                debug!(?missing, attempt, retry_in = ?backoff, "listing not current yet");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(cap);
            }
        }

        warn!(?missing, attempts, "listing never reflected upload");
        Err(SyncError::NotVisible { missing, attempts })
    }

    /// Drop registry rows for names no longer in the bucket.
    async fn forget(&self, names: &[String]) -> Result<(), SyncError> {
        for (index, name) in names.iter().enumerate() {
            registry::bounded(self.settings.op_timeout, "remove", self.registry.remove(name))
                .await
                .map_err(|source| {
                    warn!(name, error = %source, "removing stale record failed");
                    SyncError::Reconcile {
                        source,
                        pending: names[index..].to_vec(),
                    }
                })?;
            debug!(name, "removed stale record");
        }
        Ok(())
    }

    async fn apply(&self, listing: Vec<StoredObject>) -> Result<Vec<DerivedFile>, SyncError> {
        let derived = derive(&listing);
        let records: Vec<FileRecord> = derived.iter().map(DerivedFile::to_record).collect();

        registry::bounded(
            self.settings.op_timeout,
            "upsert_all",
            self.registry.upsert_all(&records),
        )
        .await
        .map_err(|source| {
            warn!(error = %source, records = records.len(), "reconcile failed");
            SyncError::Reconcile {
                source,
                pending: records.iter().map(|r| r.name.clone()).collect(),
            }
        })?;

        info!(records = records.len(), "registry reconciled with bucket listing");
        Ok(derived)
    }
}

/// Number the listing from 1 and derive each object's type from its name.
pub fn derive(listing: &[StoredObject]) -> Vec<DerivedFile> {
    listing
        .iter()
        .enumerate()
        .map(|(index, object)| {
            let record = FileRecord::from_stored(object);
            DerivedFile {
                no: index + 1,
                name: record.name,
                size: record.size,
                created: record.created,
                file_type: record.file_type,
            }
        })
        .collect()
}
