//! File Registry.
//!
//! A relational table of file metadata keyed by object name. It is a derived
//! cache of the bucket listing: rows are only written by reconciliation and
//! only removed by a full reset.

pub mod postgres;
pub mod sqlite;

use crate::models::FileRecord;
use async_trait::async_trait;
use std::{future::Future, time::Duration};
use thiserror::Error;

pub use postgres::PostgresRegistry;
pub use sqlite::SqliteRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("schema migration failed: {0}")]
    Migration(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[async_trait]
pub trait FileRegistry: Send + Sync {
    /// Insert a record, replacing the existing row with the same name.
    async fn insert(&self, record: &FileRecord) -> RegistryResult<()>;

    /// Upsert every record in one transaction; either all land or none do.
    async fn upsert_all(&self, records: &[FileRecord]) -> RegistryResult<()>;

    /// All records, newest `created` first (ties broken by name).
    async fn list_all(&self) -> RegistryResult<Vec<FileRecord>>;

    /// Remove the row for `name`; returns whether a row existed.
    async fn remove(&self, name: &str) -> RegistryResult<bool>;

    /// Remove every record and return how many rows were removed.
    async fn truncate_all(&self) -> RegistryResult<u64>;

    /// Round-trip a trivial query to confirm connectivity.
    async fn ping(&self) -> RegistryResult<()>;
}

/// Run a registry call with an upper bound on its duration.
pub async fn bounded<T, F>(timeout: Duration, op: &'static str, fut: F) -> RegistryResult<T>
where
    F: Future<Output = RegistryResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::Timeout { op, after: timeout }),
    }
}

/// Split an embedded schema file into executable statements.
fn schema_statements(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(';').map(str::trim).filter(|s| !s.is_empty())
}
