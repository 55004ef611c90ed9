//! content-blobs library
//!
//! Binary large-object storage for a content repository: inline and
//! external providers, chunked uploads, cached reads and orphan cleanup.

pub mod app;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod services;
pub mod storage;
