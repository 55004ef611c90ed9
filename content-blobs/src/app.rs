//! Application state and initialization
//!
//! This module composes the blob subsystem from its configuration. Every
//! service is built once here and shared through AppState.

use crate::config::BlobStorageConfig;
use crate::crypto::ChunkTokenCodec;
use crate::database::{create_pool, MetadataStore};
use crate::error::Result;
use crate::services::{BlobStorage, FileCleanupService};
use crate::storage::{BlobProvider, BlobProviderSelector, BuiltInBlobProvider, LocalBlobProvider};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Central state holding all services
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BlobStorageConfig>,
    pub pool: SqlitePool,
    pub storage: BlobStorage,
    pub cleanup: Arc<FileCleanupService>,
}

/// Open the metadata database and compose the subsystem
pub async fn setup(config: BlobStorageConfig) -> Result<AppState> {
    setup_with_providers(config, Vec::new()).await
}

/// Like [`setup`], registering additional external providers
pub async fn setup_with_providers(
    config: BlobStorageConfig,
    providers: Vec<Arc<dyn BlobProvider>>,
) -> Result<AppState> {
    tracing::info!("Initializing blob storage");
    config.validate()?;

    let pool = create_pool(&config.database_path).await?;
    compose(config, pool, providers).await
}

/// Build the services on top of an initialized pool
pub async fn compose(
    config: BlobStorageConfig,
    pool: SqlitePool,
    mut providers: Vec<Arc<dyn BlobProvider>>,
) -> Result<AppState> {
    let store = MetadataStore::new(pool.clone(), config.binary_cache_size);
    let built_in = Arc::new(BuiltInBlobProvider::new(
        pool.clone(),
        Arc::new(store.clone()),
        config.binary_buffer_size,
    ));

    if let Some(root) = &config.local_provider_root {
        let local = LocalBlobProvider::new(root.clone());
        local.initialize().await?;
        providers.push(Arc::new(local));
    }

    let selector = Arc::new(BlobProviderSelector::new(
        built_in,
        providers,
        config.external_provider.as_deref(),
        config.minimum_size_for_blob_provider_in_bytes,
    )?);

    let tokens = match &config.chunk_token_secret {
        Some(secret) => ChunkTokenCodec::new(secret)?,
        None => {
            tracing::warn!("No chunk token secret configured; open uploads will not survive a restart");
            ChunkTokenCodec::ephemeral()?
        }
    };

    let storage = BlobStorage::new(
        store.clone(),
        Arc::clone(&selector),
        Arc::new(tokens),
        config.binary_buffer_size,
    );
    let cleanup = Arc::new(FileCleanupService::new(store, selector, &config));

    tracing::info!("Blob storage initialized successfully");

    Ok(AppState {
        config: Arc::new(config),
        pool,
        storage,
        cleanup,
    })
}
