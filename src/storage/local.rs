//! On-disk blob store.
//!
//! Payloads are sharded beneath `root/{bucket}/{shard}/{shard}/{key}` where
//! the shards come from `md5(bucket/key)`. Writes go to a temporary file under
//! `root/.staging/{bucket}` that is fsynced and renamed into place, so a
//! listing never sees a partial object and every file in the shard tree is an
//! object.

use super::{BlobStore, StoreError, StoreResult, ensure_key_safe};
use crate::models::StoredObject;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Directory below the root that holds in-flight writes. Bucket names cannot
/// start with `.`, so it never collides with a bucket.
const STAGING_DIR: &str = ".staging";

#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    bucket: String,
    /// `root/{bucket}`; every object lives below it.
    bucket_root: PathBuf,
    /// `root/.staging/{bucket}`; same filesystem as the bucket so renames are atomic.
    staging: PathBuf,
}

impl LocalBlobStore {
    /// Open the store, creating the bucket directory if it does not exist yet.
    pub async fn open(root: impl Into<PathBuf>, bucket: impl Into<String>) -> StoreResult<Self> {
        let bucket = bucket.into();
        let root = root.into();
        let bucket_root = root.join(&bucket);
        let staging = root.join(STAGING_DIR).join(&bucket);
        fs::create_dir_all(&bucket_root).await?;
        fs::create_dir_all(&staging).await?;
        Ok(Self {
            bucket,
            bucket_root,
            staging,
        })
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(&self, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", self.bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        self.bucket_root.join(shard_a).join(shard_b).join(key)
    }

    /// Recover the object key from a payload path by dropping the two shard
    /// directories below the bucket root.
    fn key_from_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.bucket_root).ok()?;
        let parts = relative
            .components()
            .skip(2)
            .map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Every payload file below the bucket root.
    async fn payload_files(&self) -> StoreResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![self.bucket_root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // a concurrent delete_all may prune directories mid-walk
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    files.push(entry.path());
                }
            }
        }
        Ok(files)
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.bucket_root) && current != self.bucket_root {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Write bytes to a temp file, fsync, then rename over the final path.
    /// The temp file is removed on any error.
    async fn put(&self, name: &str, content: Bytes) -> StoreResult<()> {
        ensure_key_safe(name)?;
        let file_path = self.object_path(name);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StoreError::backend("put", "object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        fs::create_dir_all(&self.staging).await?;
        let tmp_path = self.staging.join(Uuid::new_v4().to_string());

        let written = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&content).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }

        debug!(name, size = content.len(), "stored object on disk");
        Ok(())
    }

    async fn list_all(&self) -> StoreResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        for path in self.payload_files().await? {
            let Some(name) = self.key_from_path(&path) else {
                continue;
            };
            let meta = match fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::Io(err)),
            };
            let created: DateTime<Utc> = meta.modified()?.into();
            objects.push(StoredObject {
                name,
                size: meta.len() as i64,
                created,
            });
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete(&self, name: &str) -> StoreResult<()> {
        ensure_key_safe(name)?;
        let file_path = self.object_path(name);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<usize> {
        let mut deleted = 0;
        let mut failed = Vec::new();
        for path in self.payload_files().await? {
            let name = self
                .key_from_path(&path)
                .unwrap_or_else(|| path.display().to_string());
            match fs::remove_file(&path).await {
                Ok(_) => deleted += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => deleted += 1,
                Err(err) => {
                    debug!("failed to delete {}: {}", path.display(), err);
                    failed.push(name);
                    continue;
                }
            }
            if let Some(parent) = path.parent() {
                self.prune_empty_dirs(parent).await;
            }
        }

        if failed.is_empty() {
            Ok(deleted)
        } else {
            Err(StoreError::PartialDelete { deleted, failed })
        }
    }

    async fn issue_write_url(
        &self,
        _name: &str,
        _ttl: Duration,
        _content_type: &str,
    ) -> StoreResult<String> {
        Err(StoreError::Unsupported(
            "signed write URLs require the s3 storage backend".into(),
        ))
    }

    async fn check(&self) -> StoreResult<()> {
        if fs::metadata(&self.bucket_root).await?.is_dir() {
            Ok(())
        } else {
            Err(StoreError::backend(
                "check",
                format!("{} is not a directory", self.bucket_root.display()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, LocalBlobStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::open(dir.path(), "uploads").await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_list_reports_name_and_size() {
        let (_dir, store) = store().await;
        store
            .put("archive.zip", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        store
            .put("nested/dir/b.tar", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let listed = store.list_all().await.unwrap();
        let names: Vec<_> = listed.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["archive.zip", "nested/dir/b.tar"]);
        assert_eq!(listed[0].size, 10);
        assert_eq!(listed[1].size, 3);
    }

    #[tokio::test]
    async fn put_overwrites_existing_object() {
        let (_dir, store) = store().await;
        store.put("a.zip", Bytes::from_static(b"first")).await.unwrap();
        store.put("a.zip", Bytes::from_static(b"2nd")).await.unwrap();

        let listed = store.list_all().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 3);
    }

    #[tokio::test]
    async fn put_rejects_traversal_keys() {
        let (_dir, store) = store().await;
        let err = store
            .put("../escape.zip", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_all_empties_bucket_and_prunes_shards() {
        let (_dir, store) = store().await;
        for name in ["a.zip", "b.zip", "deep/c.zip"] {
            store.put(name, Bytes::from_static(b"data")).await.unwrap();
        }

        assert_eq!(store.delete_all().await.unwrap(), 3);
        assert!(store.list_all().await.unwrap().is_empty());

        let mut entries = fs::read_dir(&store.bucket_root).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn check_requires_bucket_directory() {
        let (_dir, store) = store().await;
        store.check().await.unwrap();

        fs::remove_dir_all(&store.bucket_root).await.unwrap();
        assert!(matches!(store.check().await, Err(StoreError::Io(_))));

        fs::write(&store.bucket_root, b"not a dir").await.unwrap();
        assert!(matches!(
            store.check().await,
            Err(StoreError::Backend { op: "check", .. })
        ));
    }

    #[tokio::test]
    async fn listing_ignores_in_flight_writes() {
        let (_dir, store) = store().await;
        store.put("a.zip", Bytes::from_static(b"data")).await.unwrap();
        fs::write(store.staging.join("inflight"), b"partial")
            .await
            .unwrap();

        let listed = store.list_all().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a.zip");
    }

    #[tokio::test]
    async fn temp_looking_names_are_ordinary_objects() {
        let (_dir, store) = store().await;
        store
            .put(".tmp-archive.zip", Bytes::from_static(b"data"))
            .await
            .unwrap();

        let listed = store.list_all().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, ".tmp-archive.zip");

        assert_eq!(store.delete_all().await.unwrap(), 1);
        assert!(!store.object_path(".tmp-archive.zip").exists());
    }

    #[tokio::test]
    async fn put_rejects_keys_that_would_be_normalized() {
        let (_dir, store) = store().await;
        for key in ["a//b.zip", "a/./b.zip", "dir/"] {
            let err = store
                .put(key, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey { .. }), "{key:?}");
        }
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listed_names_match_stored_keys() {
        let (_dir, store) = store().await;
        for key in ["a/b.zip", "a/b/c.zip", ".hidden/x"] {
            store.put(key, Bytes::from_static(b"x")).await.unwrap();
        }
        let names: Vec<_> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec![".hidden/x", "a/b.zip", "a/b/c.zip"]);
    }

    #[tokio::test]
    async fn delete_removes_single_object() {
        let (_dir, store) = store().await;
        store.put("a.zip", Bytes::from_static(b"x")).await.unwrap();
        store.put("b.zip", Bytes::from_static(b"y")).await.unwrap();

        store.delete("a.zip").await.unwrap();
        store.delete("missing.zip").await.unwrap();

        let listed = store.list_all().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "b.zip");
    }

    #[tokio::test]
    async fn write_urls_are_unsupported() {
        let (_dir, store) = store().await;
        let err = store
            .issue_write_url("a.zip", Duration::from_secs(60), "application/zip")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }
}
