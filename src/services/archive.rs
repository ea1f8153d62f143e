//! Zip archive extraction for uploaded `.zip` files.
//!
//! Entries become objects keyed by their path inside the archive. Directory
//! entries, entries whose path escapes the archive root, and entries whose
//! key the store would reject are skipped.

use crate::storage::ensure_key_safe;
use bytes::Bytes;
use std::{
    io::{Cursor, Read},
    path::{Component, Path},
};
use thiserror::Error;
use tracing::{debug, warn};
use zip::{ZipArchive, result::ZipError};

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("not a readable zip archive: {0}")]
    Corrupt(#[from] ZipError),
    #[error("archive expands beyond {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("reading archive entry `{name}`: {source}")]
    Entry {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("extraction task failed: {0}")]
    Task(String),
}

/// One file taken out of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub content: Bytes,
}

/// Whether `name` should be treated as an archive.
pub fn is_archive(name: &str) -> bool {
    name.ends_with(".zip")
}

/// Extract every file in `content` on the blocking pool.
///
/// `archive_name` is skipped if the archive contains itself. The total
/// uncompressed size is capped at `limit` bytes.
pub async fn extract(
    archive_name: &str,
    content: Bytes,
    limit: u64,
) -> Result<Vec<ArchiveEntry>, UnpackError> {
    let archive_name = archive_name.to_string();
    tokio::task::spawn_blocking(move || extract_blocking(&archive_name, content, limit))
        .await
        .map_err(|e| UnpackError::Task(e.to_string()))?
}

fn extract_blocking(
    archive_name: &str,
    content: Bytes,
    limit: u64,
) -> Result<Vec<ArchiveEntry>, UnpackError> {
    let mut archive = ZipArchive::new(Cursor::new(content))?;
    let mut entries = Vec::new();
    let mut remaining = limit;

    for index in 0..archive.len() {
        let file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let Some(name) = file.enclosed_name().as_deref().and_then(entry_key) else {
            warn!(entry = file.name(), "skipping archive entry outside the archive root");
            continue;
        };
        if name == archive_name {
            continue;
        }
        if let Err(err) = ensure_key_safe(&name) {
            warn!(entry = %name, error = %err, "skipping archive entry with unusable name");
            continue;
        }

        // read one byte past the budget so a lying header cannot slip through
        let mut buf = Vec::new();
        file.take(remaining.saturating_add(1))
            .read_to_end(&mut buf)
            .map_err(|source| UnpackError::Entry {
                name: name.clone(),
                source,
            })?;
        let read = buf.len() as u64;
        if read > remaining {
            return Err(UnpackError::TooLarge { limit });
        }
        remaining -= read;

        debug!(entry = %name, size = read, "extracted archive entry");
        entries.push(ArchiveEntry {
            name,
            content: Bytes::from(buf),
        });
    }
    Ok(entries)
}

/// Join the normal components of an in-archive path with `/`.
fn entry_key(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::{ZipWriter, write::SimpleFileOptions};

    /// Build an in-memory zip holding `files`; names ending in `/` become directories.
    pub(crate) fn zip_of(files: &[(&str, &str)]) -> Bytes {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in files {
            if name.ends_with('/') {
                writer
                    .add_directory(*name, SimpleFileOptions::default())
                    .unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        Bytes::from(writer.finish().unwrap().into_inner())
    }

    #[tokio::test]
    async fn extracts_files_with_nested_paths() {
        let archive = zip_of(&[
            ("docs/", ""),
            ("docs/readme.txt", "hello"),
            ("data.csv", "a,b\n1,2\n"),
        ]);

        let entries = extract("bundle.zip", archive, 1024).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["docs/readme.txt", "data.csv"]);
        assert_eq!(entries[0].content, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn skips_the_archive_itself_and_escaping_entries() {
        let archive = zip_of(&[
            ("bundle.zip", "nested"),
            ("../evil.txt", "x"),
            ("ok.txt", "y"),
        ]);

        let entries = extract("bundle.zip", archive, 1024).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ok.txt"]);
    }

    #[tokio::test]
    async fn rejects_archives_past_the_size_limit() {
        let big = "x".repeat(4096);
        let archive = zip_of(&[("big.bin", big.as_str())]);

        let err = extract("big.zip", archive, 1000).await.unwrap_err();
        assert!(matches!(err, UnpackError::TooLarge { limit: 1000 }));
    }

    #[tokio::test]
    async fn non_zip_bytes_are_corrupt() {
        let err = extract("archive.zip", Bytes::from_static(b"0123456789"), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, UnpackError::Corrupt(_)));
    }

    #[test]
    fn only_zip_names_are_archives() {
        assert!(is_archive("a.zip"));
        assert!(is_archive("dir/a.zip"));
        assert!(!is_archive("a.zip.txt"));
        assert!(!is_archive("zip"));
    }
}
