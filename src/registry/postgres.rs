//! PostgreSQL-backed registry for production deployments.

use super::{FileRegistry, RegistryError, RegistryResult, schema_statements};
use crate::models::FileRecord;
use async_trait::async_trait;
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = include_str!("../../migrations/postgres/0001_files.sql");

const UPSERT: &str = "INSERT INTO files (name, size, created, type) VALUES ($1, $2, $3, $4)
     ON CONFLICT (name) DO UPDATE SET
         size = EXCLUDED.size,
         created = EXCLUDED.created,
         type = EXCLUDED.type";

/// Connection parameters for [`PostgresRegistry`].
#[derive(Clone)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Clone, Debug)]
pub struct PostgresRegistry {
    pool: PgPool,
}

impl PostgresRegistry {
    pub async fn connect(settings: &PgSettings, acquire_timeout: Duration) -> RegistryResult<Self> {
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(&settings.password)
            .database(&settings.database);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
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
impl FileRegistry for PostgresRegistry {
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
        let result = sqlx::query("DELETE FROM files WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn truncate_all(&self) -> RegistryResult<u64> {
        let mut tx = self.pool.begin().await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("TRUNCATE TABLE files").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(count as u64)
    }

    async fn ping(&self) -> RegistryResult<()> {
        sqlx::query("SELECT NOW()").execute(&self.pool).await?;
        Ok(())
    }
}
