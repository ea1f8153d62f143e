//! SQLite-backed registry, used for local development and tests.

use super::{FileRegistry, RegistryError, RegistryResult, schema_statements};
use crate::models::FileRecord;
use async_trait::async_trait;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, time::Duration};
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/sqlite/0001_files.sql");

const UPSERT: &str = "INSERT INTO files (name, size, created, type) VALUES (?, ?, ?, ?)
     ON CONFLICT(name) DO UPDATE SET
         size = excluded.size,
         created = excluded.created,
         type = excluded.type";

#[derive(Clone, Debug)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    /// Connect to the database at `url`, creating the file (and its parent
    /// directory) if needed, and apply the schema.
    pub async fn connect(url: &str) -> RegistryResult<Self> {
        let db_path = url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .trim_start_matches("file:");
        debug!("Interpreted SQLite path => {}", db_path);

        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RegistryError::Sqlx(sqlx::Error::Io(e)))?;
                info!("Created missing directory {:?}", parent);
            }
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    /// A private in-memory database.
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> RegistryResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let registry = Self { pool };
        registry.migrate().await?;
        Ok(registry)
    }

    /// Apply the embedded schema. Safe to run on every startup.
    pub async fn migrate(&self) -> RegistryResult<()> {
        for stmt in schema_statements(SCHEMA) {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| RegistryError::Migration(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileRegistry for SqliteRegistry {
    async fn insert(&self, record: &FileRecord) -> RegistryResult<()> {
        sqlx::query(UPSERT)
            .bind(&record.name)
            .bind(record.size)
            .bind(record.created)
            .bind(&record.file_type)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_all(&self, records: &[FileRecord]) -> RegistryResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(UPSERT)
                .bind(&record.name)
                .bind(record.size)
                .bind(record.created)
                .bind(&record.file_type)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_all(&self) -> RegistryResult<Vec<FileRecord>> {
        let rows = sqlx::query_as::<_, FileRecord>(
            "SELECT name, size, created, type FROM files ORDER BY created DESC, name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn remove(&self, name: &str) -> RegistryResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn truncate_all(&self) -> RegistryResult<u64> {
        let result = sqlx::query("DELETE FROM files").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> RegistryResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(name: &str, size: i64, created: DateTime<Utc>) -> FileRecord {
        FileRecord {
            name: name.into(),
            size,
            created,
            file_type: crate::models::derive_type(name),
        }
    }

    #[tokio::test]
    async fn insert_upserts_by_name() {
        let registry = SqliteRegistry::in_memory().await.unwrap();
        registry.insert(&record("a.zip", 1, at(0))).await.unwrap();
        registry.insert(&record("a.zip", 42, at(5))).await.unwrap();

        let rows = registry.list_all().await.unwrap();
        assert_eq!(rows, vec![record("a.zip", 42, at(5))]);
    }

    #[tokio::test]
    async fn upsert_all_twice_leaves_one_row_per_name() {
        let registry = SqliteRegistry::in_memory().await.unwrap();
        let batch = vec![record("a.zip", 1, at(0)), record("b.zip", 2, at(1))];
        registry.upsert_all(&batch).await.unwrap();
        registry.upsert_all(&batch).await.unwrap();

        assert_eq!(registry.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let registry = SqliteRegistry::in_memory().await.unwrap();
        registry
            .upsert_all(&[
                record("t2.zip", 1, at(20)),
                record("t1.zip", 1, at(10)),
                record("t3.zip", 1, at(30)),
            ])
            .await
            .unwrap();

        let names: Vec<_> = registry
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["t3.zip", "t2.zip", "t1.zip"]);
    }

    #[tokio::test]
    async fn truncate_removes_everything() {
        let registry = SqliteRegistry::in_memory().await.unwrap();
        registry
            .upsert_all(&[record("a.zip", 1, at(0)), record("b", 1, at(1))])
            .await
            .unwrap();

        assert_eq!(registry.truncate_all().await.unwrap(), 2);
        assert!(registry.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_only_the_named_row() {
        let registry = SqliteRegistry::in_memory().await.unwrap();
        registry
            .upsert_all(&[record("bundle.zip", 1, at(0)), record("a.txt", 1, at(1))])
            .await
            .unwrap();

        assert!(registry.remove("bundle.zip").await.unwrap());
        assert!(!registry.remove("bundle.zip").await.unwrap());
        let rows = registry.list_all().await.unwrap();
        assert_eq!(rows, vec![record("a.txt", 1, at(1))]);
    }

    #[tokio::test]
    async fn connect_creates_database_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meta/files.db");
        let url = format!("sqlite://{}", path.display());

        let registry = SqliteRegistry::connect(&url).await.unwrap();
        registry.ping().await.unwrap();
        assert!(path.exists());
    }
}
