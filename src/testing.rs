//! In-memory fakes for the store and registry seams.

use crate::{
    models::{FileRecord, StoredObject},
    registry::{FileRegistry, RegistryError, RegistryResult},
    storage::{BlobStore, StoreError, StoreResult},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

struct MemoryObject {
    size: i64,
    created: DateTime<Utc>,
    /// First listing call (0-based) that may observe this object.
    visible_from: usize,
}

/// Eventually consistent bucket: a put only shows up after `lag` further listings.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    lag: AtomicUsize,
    lists: AtomicUsize,
    pub fail_put: AtomicBool,
    pub fail_list: AtomicBool,
    /// Names whose deletion fails.
    pub undeletable: Mutex<Vec<String>>,
    events: Mutex<Vec<(&'static str, Instant)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lag(lag: usize) -> Self {
        let store = Self::default();
        store.lag.store(lag, Ordering::SeqCst);
        store
    }

    /// Place an object that is visible immediately, with a fixed timestamp.
    pub fn seed(&self, name: &str, size: i64, created: DateTime<Utc>) {
        self.objects.lock().unwrap().insert(
            name.to_string(),
            MemoryObject {
                size,
                created,
                visible_from: 0,
            },
        );
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Recorded operation names with the instant each started.
    pub fn events(&self) -> Vec<(&'static str, Instant)> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str) {
        self.events.lock().unwrap().push((op, Instant::now()));
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn bucket(&self) -> &str {
        "memory"
    }

    async fn put(&self, name: &str, content: Bytes) -> StoreResult<()> {
        self.record("put");
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StoreError::backend("put", "quota exceeded"));
        }
        let visible_from = self.lists.load(Ordering::SeqCst) + self.lag.load(Ordering::SeqCst);
        self.objects.lock().unwrap().insert(
            name.to_string(),
            MemoryObject {
                size: content.len() as i64,
                created: Utc::now(),
                visible_from,
            },
        );
        Ok(())
    }

    async fn list_all(&self) -> StoreResult<Vec<StoredObject>> {
        self.record("list");
        let call = self.lists.fetch_add(1, Ordering::SeqCst);
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StoreError::backend("list_all", "connection reset"));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, o)| o.visible_from <= call)
            .map(|(name, o)| StoredObject {
                name: name.clone(),
                size: o.size,
                created: o.created,
            })
            .collect())
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        self.record("delete");
        if self.undeletable.lock().unwrap().iter().any(|n| n == name) {
            return Err(StoreError::backend("delete", "permission denied"));
        }
        self.objects.lock().unwrap().remove(name);
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<usize> {
        self.record("delete_all");
        let undeletable = self.undeletable.lock().unwrap().clone();
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|name, _| undeletable.contains(name));
        let failed: Vec<String> = objects.keys().cloned().collect();
        let deleted = before - failed.len();
        if failed.is_empty() {
            Ok(deleted)
        } else {
            Err(StoreError::PartialDelete { deleted, failed })
        }
    }

    async fn issue_write_url(
        &self,
        name: &str,
        ttl: Duration,
        content_type: &str,
    ) -> StoreResult<String> {
        Ok(format!(
            "https://memory.test/{name}?expires={}&content-type={content_type}",
            ttl.as_secs()
        ))
    }

    async fn check(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    rows: Mutex<BTreeMap<String, FileRecord>>,
    pub fail_writes: AtomicBool,
    pub fail_reads: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn names(&self) -> Vec<String> {
        self.rows.lock().unwrap().keys().cloned().collect()
    }

    fn check_writes(&self) -> RegistryResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(RegistryError::Sqlx(sqlx::Error::Protocol(
                "registry unavailable".into(),
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FileRegistry for MemoryRegistry {
    async fn insert(&self, record: &FileRecord) -> RegistryResult<()> {
        self.check_writes()?;
        self.rows
            .lock()
            .unwrap()
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn upsert_all(&self, records: &[FileRecord]) -> RegistryResult<()> {
        self.check_writes()?;
        let mut rows = self.rows.lock().unwrap();
        for record in records {
            rows.insert(record.name.clone(), record.clone());
        }
        Ok(())
    }

    async fn list_all(&self) -> RegistryResult<Vec<FileRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RegistryError::Sqlx(sqlx::Error::PoolTimedOut));
        }
        let mut rows: Vec<FileRecord> = self.rows.lock().unwrap().values().cloned().collect();
        rows.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.name.cmp(&b.name)));
        Ok(rows)
    }

    async fn remove(&self, name: &str) -> RegistryResult<bool> {
        self.check_writes()?;
        Ok(self.rows.lock().unwrap().remove(name).is_some())
    }

    async fn truncate_all(&self) -> RegistryResult<u64> {
        self.check_writes()?;
        let mut rows = self.rows.lock().unwrap();
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }

    async fn ping(&self) -> RegistryResult<()> {
        Ok(())
    }
}
