//! Database module
//!
//! This module provides the relational metadata store:
//! - Schema and migrations
//! - Model definitions
//! - Simple binary property paths, the chunked upload protocol and the
//!   cleanup phases, all on [`MetadataStore`]

pub mod chunks;
pub mod cleanup;
pub mod models;
pub mod repository;
pub mod schema;

pub use cleanup::PendingFileDeletion;
pub use models::*;
pub use repository::MetadataStore;
pub use schema::initialize_database;

use crate::error::Result;
use sqlx::sqlite::{SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

const POOL_SIZE: u32 = 5;

/// Options for every connection to the metadata database.
///
/// Inline streams make the file grow and shrink by whole binaries, so pages
/// freed by the cleanup drain are returned through incremental vacuum.
fn connect_options(db_path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(SqliteJournalMode::Wal)
        .auto_vacuum(SqliteAutoVacuum::Incremental)
        .foreign_keys(true)
}

async fn open_pool(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(connect_options(db_path))
        .await?;
    Ok(pool)
}

/// Open the metadata database, migrating it first.
///
/// Migrations run on their own single connection, closed before the
/// application pool opens, so no pooled connection caches the old schema.
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    tracing::info!("Opening blob metadata database at {:?}", db_path);

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let migration_pool = open_pool(db_path, 1).await?;
    initialize_database(&migration_pool).await?;
    migration_pool.close().await;

    open_pool(db_path, POOL_SIZE).await
}

/// Single-connection in-memory pool with the schema applied
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    initialize_database(&pool).await.unwrap();
    pool
}
