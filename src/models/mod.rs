//! Core data models for the file inventory.
//!
//! `StoredObject` is what the blob store reports, `FileRecord` is what the
//! registry persists, and `DerivedFile` / `FileView` are the shapes returned
//! over HTTP. They map to database rows via `sqlx::FromRow` and serialize as
//! JSON via `serde`.

pub mod file_record;

pub use file_record::{DerivedFile, FileRecord, FileView, StoredObject, derive_type};
