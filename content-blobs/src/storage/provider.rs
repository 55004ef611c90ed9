//! Blob provider capability
//!
//! Every storage backend implements [`BlobProvider`]. The metadata store never
//! inspects provider types: it switches on [`ProviderHandle`], which is either
//! the built-in provider (bytes inline in the `Files` row) or an external
//! provider addressed by its opaque, provider-specific data.

use crate::error::{BlobStorageError, Result};
use crate::storage::builtin::BuiltInBlobProvider;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// Random-access readable stream
pub trait ReadSeek: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T> ReadSeek for T where T: AsyncRead + AsyncSeek + Send + Unpin {}

pub type BlobReadStream = Box<dyn ReadSeek>;
pub type BlobWriteStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Provider-specific addressing data, decoded once from the stored string
#[derive(Clone)]
pub enum ProviderData {
    /// The built-in provider carries no addressing data of its own.
    BuiltIn,
    External {
        raw: serde_json::Value,
        decoded: Option<Arc<dyn Any + Send + Sync>>,
    },
}

impl ProviderData {
    /// External data with no location recorded yet
    pub fn unallocated() -> Self {
        ProviderData::External {
            raw: serde_json::Value::Null,
            decoded: None,
        }
    }

    /// Untyped external data, for providers that read the JSON themselves
    pub fn raw(raw: serde_json::Value) -> Self {
        ProviderData::External { raw, decoded: None }
    }

    pub fn external<T>(data: T) -> Result<Self>
    where
        T: Serialize + Send + Sync + 'static,
    {
        Ok(ProviderData::External {
            raw: serde_json::to_value(&data)?,
            decoded: Some(Arc::new(data)),
        })
    }

    /// Parse the stored string straight into a provider's own type
    pub fn decode<T>(text: &str) -> Result<Self>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let data = T::deserialize(&raw)?;
        Ok(ProviderData::External {
            raw,
            decoded: Some(Arc::new(data)),
        })
    }

    /// The decoded payload. Data left untyped by `parse_data` is decoded here.
    pub fn typed<T>(&self) -> Result<Arc<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        match self {
            ProviderData::External { raw, decoded } => {
                if let Some(data) = decoded.clone().and_then(|d| d.downcast::<T>().ok()) {
                    return Ok(data);
                }
                Ok(Arc::new(T::deserialize(raw)?))
            }
            ProviderData::BuiltIn => Err(BlobStorageError::InvalidArgument(
                "built-in provider data carries no payload".to_string(),
            )),
        }
    }

    pub fn is_decoded(&self) -> bool {
        matches!(self, ProviderData::External { decoded: Some(_), .. })
    }

    /// The string stored in `Files.BlobProviderData`
    pub fn to_stored(&self) -> Result<Option<String>> {
        match self {
            ProviderData::BuiltIn => Ok(None),
            ProviderData::External { raw, .. } if raw.is_null() => Ok(None),
            ProviderData::External { raw, .. } => Ok(Some(serde_json::to_string(raw)?)),
        }
    }
}

impl fmt::Debug for ProviderData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderData::BuiltIn => f.write_str("BuiltIn"),
            ProviderData::External { raw, .. } => f.debug_tuple("External").field(raw).finish(),
        }
    }
}

/// Storage backend contract
#[async_trait]
pub trait BlobProvider: Send + Sync {
    /// Name recorded in `Files.BlobProvider`
    fn name(&self) -> &str;

    /// Decode `Files.BlobProviderData`. Providers override this to decode
    /// into their own type once per context.
    fn parse_data(&self, text: &str) -> Result<ProviderData> {
        Ok(ProviderData::raw(serde_json::from_str(text)?))
    }

    /// Reserve a location before any byte is written and record it in
    /// `ctx.provider_data`.
    async fn allocate(&self, ctx: &mut BlobStorageContext) -> Result<()>;

    /// Write `buffer` at byte `offset`; a gap before `offset` reads as zeros.
    async fn write(&self, ctx: &BlobStorageContext, offset: i64, buffer: &[u8]) -> Result<()>;

    async fn get_stream_for_read(&self, ctx: &BlobStorageContext) -> Result<BlobReadStream>;

    async fn get_stream_for_write(&self, ctx: &BlobStorageContext) -> Result<BlobWriteStream>;

    /// Independent stream over the same content, positioned at the start.
    async fn clone_stream(
        &self,
        ctx: &BlobStorageContext,
        stream: BlobReadStream,
    ) -> Result<BlobReadStream> {
        drop(stream);
        self.get_stream_for_read(ctx).await
    }

    /// Empty the content but keep the location
    async fn clear(&self, ctx: &BlobStorageContext) -> Result<()>;

    async fn delete(&self, ctx: &BlobStorageContext) -> Result<()>;
}

/// The provider owning a binary
#[derive(Clone)]
pub enum ProviderHandle {
    BuiltIn(Arc<BuiltInBlobProvider>),
    External(Arc<dyn BlobProvider>),
}

impl ProviderHandle {
    pub fn provider(&self) -> &dyn BlobProvider {
        match self {
            ProviderHandle::BuiltIn(provider) => provider.as_ref(),
            ProviderHandle::External(provider) => provider.as_ref(),
        }
    }

    pub fn is_built_in(&self) -> bool {
        matches!(self, ProviderHandle::BuiltIn(_))
    }

    pub fn name(&self) -> &str {
        self.provider().name()
    }

    /// Value of `Files.BlobProvider`; built-in rows store null
    pub fn stored_name(&self) -> Option<String> {
        match self {
            ProviderHandle::BuiltIn(_) => None,
            ProviderHandle::External(provider) => Some(provider.name().to_string()),
        }
    }

    /// Decode stored provider data for this provider
    pub fn parse_data(&self, text: Option<&str>) -> Result<ProviderData> {
        match (self, text) {
            (ProviderHandle::BuiltIn(_), _) => Ok(ProviderData::BuiltIn),
            (ProviderHandle::External(provider), Some(text)) => provider.parse_data(text),
            (ProviderHandle::External(provider), None) => Err(BlobStorageError::NotFound(format!(
                "no provider data stored for provider {}",
                provider.name()
            ))),
        }
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderHandle::BuiltIn(_) => f.write_str("BuiltIn"),
            ProviderHandle::External(provider) => {
                f.debug_tuple("External").field(&provider.name()).finish()
            }
        }
    }
}

/// Everything a provider operation needs to locate one binary
#[derive(Debug, Clone)]
pub struct BlobStorageContext {
    pub file_id: i64,
    pub version_id: i64,
    pub property_type_id: i64,
    pub length: i64,
    pub provider: ProviderHandle,
    pub provider_data: ProviderData,
}

impl BlobStorageContext {
    /// Context for content that has no location yet
    pub fn new(
        provider: ProviderHandle,
        version_id: i64,
        property_type_id: i64,
        file_id: i64,
        length: i64,
    ) -> Self {
        let provider_data = if provider.is_built_in() {
            ProviderData::BuiltIn
        } else {
            ProviderData::unallocated()
        };

        Self {
            file_id,
            version_id,
            property_type_id,
            length,
            provider,
            provider_data,
        }
    }

    /// Context for a stored file row
    pub fn from_stored(
        provider: ProviderHandle,
        file_id: i64,
        length: i64,
        provider_data: Option<&str>,
    ) -> Result<Self> {
        let provider_data = provider.parse_data(provider_data)?;

        Ok(Self {
            file_id,
            version_id: 0,
            property_type_id: 0,
            length,
            provider,
            provider_data,
        })
    }

    pub fn with_owner(mut self, version_id: i64, property_type_id: i64) -> Self {
        self.version_id = version_id;
        self.property_type_id = property_type_id;
        self
    }

    pub fn stored_provider_data(&self) -> Result<Option<String>> {
        self.provider_data.to_stored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Location {
        path: String,
    }

    #[test]
    fn test_built_in_data_is_stored_as_null() {
        assert_eq!(ProviderData::BuiltIn.to_stored().unwrap(), None);
        assert_eq!(ProviderData::unallocated().to_stored().unwrap(), None);
    }

    #[test]
    fn test_external_data_decodes_once() {
        let data = ProviderData::decode::<Location>(r#"{"path":"ab/cd/abcd"}"#).unwrap();
        assert!(data.is_decoded());

        let first: Arc<Location> = data.typed().unwrap();
        let second: Arc<Location> = data.typed().unwrap();
        assert_eq!(first.path, "ab/cd/abcd");
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!(data.to_stored().unwrap().as_deref(), Some(r#"{"path":"ab/cd/abcd"}"#));
    }

    #[test]
    fn test_untyped_data_still_decodes() {
        let data = ProviderData::raw(serde_json::json!({ "path": "ef/01/ef01" }));
        assert!(!data.is_decoded());

        let location: Arc<Location> = data.typed().unwrap();
        assert_eq!(location.path, "ef/01/ef01");
    }

    #[test]
    fn test_built_in_data_has_no_payload() {
        assert!(ProviderData::BuiltIn.typed::<Location>().is_err());
    }
}
