//! S3-compatible blob store.
//!
//! Works against AWS S3 and S3-compatible services (MinIO, Backblaze B2,
//! Tigris, ...). Credentials are passed explicitly from configuration.

use super::{BlobStore, StoreError, StoreResult, ensure_key_safe, validate_expiry};
use crate::models::StoredObject;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    primitives::{ByteStream, DateTime as AwsDateTime},
    types::{Delete, ObjectIdentifier},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::time::Duration;
use tracing::{debug, warn};

/// DeleteObjects accepts at most this many keys per request.
const DELETE_BATCH: usize = 1000;
const DELETE_CONCURRENCY: usize = 4;

/// Connection settings for [`S3BlobStore`].
#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(settings: S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id,
            settings.secret_access_key,
            None,
            None,
            "file-drop-config",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(settings.region))
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // path-style addressing for S3-compatible services
            .force_path_style(true);
        if let Some(endpoint) = settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        debug!(bucket = %settings.bucket, "created S3 blob store");
        Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket,
        }
    }

    /// Delete one batch and return the keys that were not removed.
    async fn delete_or_collect(&self, batch: Vec<String>) -> Vec<String> {
        match self.delete_batch(&batch).await {
            Ok(errors) => errors,
            Err(err) => {
                warn!(error = %err, batch = batch.len(), "delete batch failed");
                batch
            }
        }
    }

    async fn delete_batch(&self, keys: &[String]) -> StoreResult<Vec<String>> {
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::backend("delete_all", e))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| StoreError::backend("delete_all", e))?;

        let output = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| StoreError::backend("delete_all", DisplayErrorContext(e)))?;

        Ok(output
            .errors()
            .iter()
            .map(|err| {
                warn!(
                    key = err.key().unwrap_or_default(),
                    code = err.code().unwrap_or_default(),
                    "failed to delete object"
                );
                err.key().unwrap_or_default().to_string()
            })
            .collect())
    }
}

/// Convert an AWS timestamp into a chrono UTC timestamp.
fn to_utc(dt: &AwsDateTime) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
        .ok_or_else(|| StoreError::backend("list_all", "object timestamp out of range"))
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(&self, name: &str, content: Bytes) -> StoreResult<()> {
        ensure_key_safe(name)?;
        let size = content.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(|e| StoreError::backend("put", DisplayErrorContext(e)))?;
        debug!(name, size, bucket = %self.bucket, "stored object in S3");
        Ok(())
    }

    async fn list_all(&self) -> StoreResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| StoreError::backend("list_all", DisplayErrorContext(e)))?;
            for object in page.contents() {
                let Some(name) = object.key() else {
                    continue;
                };
                let created = match object.last_modified() {
                    Some(ts) => to_utc(ts)?,
                    None => {
                        return Err(StoreError::backend(
                            "list_all",
                            format!("object `{name}` has no timestamp"),
                        ));
                    }
                };
                objects.push(StoredObject {
                    name: name.to_string(),
                    size: object.size().unwrap_or_default(),
                    created,
                });
            }
        }
        Ok(objects)
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        ensure_key_safe(name)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| StoreError::backend("delete", DisplayErrorContext(e)))?;
        debug!(name, bucket = %self.bucket, "deleted object from S3");
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<usize> {
        let keys: Vec<String> = self.list_all().await?.into_iter().map(|o| o.name).collect();
        let batches: Vec<Vec<String>> = keys.chunks(DELETE_BATCH).map(<[String]>::to_vec).collect();
        // each batch future owns its client handle and keys
        let failed: Vec<String> = stream::iter(batches)
            .map(|batch| {
                let store = self.clone();
                async move { store.delete_or_collect(batch).await }
            })
            .buffer_unordered(DELETE_CONCURRENCY)
            .concat()
            .await;

        let deleted = keys.len() - failed.len();
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
        ensure_key_safe(name)?;
        validate_expiry(ttl)?;
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::Presign(format!("invalid presigning config: {e}")))?;
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .content_type(content_type)
            .presigned(config)
            .await
            .map_err(|e| StoreError::Presign(DisplayErrorContext(e).to_string()))?;
        Ok(request.uri().to_string())
    }

    async fn check(&self) -> StoreResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StoreError::backend("check", DisplayErrorContext(e)))?;
        Ok(())
    }
}
