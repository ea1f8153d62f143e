//! Represents a stored object's metadata as known to the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One entry of a bucket listing, exactly as the store reports it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Full storage key, including any path-like prefix.
    pub name: String,

    /// Size in bytes at listing time.
    pub size: i64,

    /// Timestamp assigned by the store when the object was written.
    pub created: DateTime<Utc>,
}

/// A row of the `files` table.
///
/// `name` is the identity key; there is at most one record per name.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub size: i64,
    pub created: DateTime<Utc>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub file_type: String,
}

impl FileRecord {
    /// Build a record from a listing entry, deriving `type` from the name.
    pub fn from_stored(object: &StoredObject) -> Self {
        Self {
            name: object.name.clone(),
            size: object.size,
            created: object.created,
            file_type: derive_type(&object.name),
        }
    }
}

/// A record as reported back to the uploader, with its 1-based
/// position in the listing. `no` is presentation only and never persisted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DerivedFile {
    pub no: usize,
    pub name: String,
    pub size: i64,
    pub created: DateTime<Utc>,
    #[serde(rename = "type")]
    pub file_type: String,
}

impl DerivedFile {
    pub fn to_record(&self) -> FileRecord {
        FileRecord {
            name: self.name.clone(),
            size: self.size,
            created: self.created,
            file_type: self.file_type.clone(),
        }
    }
}

/// A registry row as served by `GET /files`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileView {
    pub name: String,
    pub size: i64,
    pub created: DateTime<Utc>,
    #[serde(rename = "type")]
    pub file_type: String,
}

impl From<FileRecord> for FileView {
    /// The stored `type` column is ignored and recomputed from `name`.
    fn from(record: FileRecord) -> Self {
        let file_type = derive_type(&record.name);
        Self {
            name: record.name,
            size: record.size,
            created: record.created,
            file_type,
        }
    }
}

/// Derive a file type from an object name.
///
/// Returns the text after the last `.`, or an empty string when the name
/// contains no `.` at all.
pub fn derive_type(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_string(),
        None => String::new(),
    }
}
