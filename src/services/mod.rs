pub mod archive;
pub mod file_service;
pub mod sync_service;
