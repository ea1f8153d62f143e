//! Archive upload service: stores dropped files in an object-storage bucket
//! and keeps a relational registry of their metadata in sync with it.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod routes;
pub mod services;
pub mod storage;

#[cfg(test)]
mod testing;
