//! Provider selection and lookup
//!
//! New content is routed by size: payloads below the configured threshold
//! stay inline in the metadata database, larger ones go to the configured
//! external provider when there is one. Stored content is always served by
//! the provider named in its row.

use crate::error::{BlobStorageError, Result};
use crate::storage::builtin::{BuiltInBlobProvider, BUILT_IN_PROVIDER_NAME};
use crate::storage::provider::{BlobProvider, BlobStorageContext, ProviderHandle};
use std::collections::HashMap;
use std::sync::Arc;

pub struct BlobProviderSelector {
    built_in: ProviderHandle,
    providers: HashMap<String, ProviderHandle>,
    external: Option<ProviderHandle>,
    minimum_size_for_blob_provider: i64,
}

impl BlobProviderSelector {
    /// `external_provider` must name one of `providers` when set.
    pub fn new(
        built_in: Arc<BuiltInBlobProvider>,
        providers: Vec<Arc<dyn BlobProvider>>,
        external_provider: Option<&str>,
        minimum_size_for_blob_provider: i64,
    ) -> Result<Self> {
        let mut registry = HashMap::new();
        for provider in providers {
            let name = provider.name().to_string();
            if name == BUILT_IN_PROVIDER_NAME || registry.contains_key(&name) {
                return Err(BlobStorageError::Configuration(format!(
                    "blob provider {} is registered twice",
                    name
                )));
            }
            registry.insert(name, ProviderHandle::External(provider));
        }

        let external = match external_provider {
            Some(name) => Some(registry.get(name).cloned().ok_or_else(|| {
                BlobStorageError::Configuration(format!(
                    "external blob provider {} is not registered",
                    name
                ))
            })?),
            None => None,
        };

        tracing::info!(
            "Blob providers: built-in plus {:?}; external: {:?} from {} bytes",
            registry.keys().collect::<Vec<_>>(),
            external_provider,
            minimum_size_for_blob_provider
        );

        Ok(Self {
            built_in: ProviderHandle::BuiltIn(built_in),
            providers: registry,
            external,
            minimum_size_for_blob_provider,
        })
    }

    pub fn built_in(&self) -> &ProviderHandle {
        &self.built_in
    }

    pub fn external(&self) -> Option<&ProviderHandle> {
        self.external.as_ref()
    }

    pub fn minimum_size_for_blob_provider(&self) -> i64 {
        self.minimum_size_for_blob_provider
    }

    /// Provider for new content of `full_size` bytes
    pub fn select_provider(&self, full_size: i64) -> ProviderHandle {
        select(
            full_size,
            self.minimum_size_for_blob_provider,
            self.external.as_ref(),
            &self.built_in,
        )
        .clone()
    }

    /// Provider named in a stored row; `None` is the built-in provider
    pub fn get_provider(&self, name: Option<&str>) -> Result<ProviderHandle> {
        match name {
            None | Some(BUILT_IN_PROVIDER_NAME) => Ok(self.built_in.clone()),
            Some(name) => self
                .providers
                .get(name)
                .cloned()
                .ok_or_else(|| BlobStorageError::ProviderNotFound(name.to_string())),
        }
    }

    /// Context for a stored file row, decoding its provider data once
    pub fn create_context(
        &self,
        file_id: i64,
        length: i64,
        provider_name: Option<&str>,
        provider_data: Option<&str>,
    ) -> Result<BlobStorageContext> {
        let provider = self.get_provider(provider_name)?;
        BlobStorageContext::from_stored(provider, file_id, length, provider_data)
    }
}

/// Routing rule: inline below the threshold or when no external store exists
pub fn select<'a>(
    full_size: i64,
    minimum_size_for_blob_provider: i64,
    external: Option<&'a ProviderHandle>,
    built_in: &'a ProviderHandle,
) -> &'a ProviderHandle {
    if full_size < minimum_size_for_blob_provider {
        return built_in;
    }
    external.unwrap_or(built_in)
}
