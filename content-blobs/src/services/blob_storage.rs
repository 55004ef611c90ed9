//! Blob storage service
//!
//! Entry point for the content repository: routes new content through the
//! provider selector, serves stored content through the provider named in
//! its row, and hands out sealed chunk tokens for multi-call uploads.

use crate::crypto::ChunkTokenCodec;
use crate::database::{BinaryContent, BinaryDataValue, ChunkToken, InsertOutcome, MetadataStore};
use crate::error::{BlobStorageError, Result};
use crate::storage::provider::{BlobReadStream, BlobStorageContext};
use crate::storage::selector::BlobProviderSelector;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A binary's metadata plus its bytes when small enough to cache
#[derive(Debug, Clone)]
pub struct BinaryCacheEntity {
    pub length: i64,
    /// Only present below the configured cache ceiling
    pub raw_data: Option<Vec<u8>>,
    pub binary_property_id: i64,
    pub file_id: i64,
    pub context: BlobStorageContext,
}

/// Service for storing and reading binary property values
#[derive(Clone)]
pub struct BlobStorage {
    store: MetadataStore,
    selector: Arc<BlobProviderSelector>,
    tokens: Arc<ChunkTokenCodec>,
    buffer_size: usize,
}

impl BlobStorage {
    pub fn new(
        store: MetadataStore,
        selector: Arc<BlobProviderSelector>,
        tokens: Arc<ChunkTokenCodec>,
        buffer_size: usize,
    ) -> Self {
        Self {
            store,
            selector,
            tokens,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn selector(&self) -> &BlobProviderSelector {
        &self.selector
    }

    pub async fn insert_binary_property(
        &self,
        value: &mut BinaryDataValue,
        version_id: i64,
        property_type_id: i64,
        is_new_node: bool,
    ) -> Result<InsertOutcome> {
        let provider = self.selector.select_provider(value.stream_length());
        self.store
            .insert_binary_property(&provider, value, version_id, property_type_id, is_new_node)
            .await
    }

    /// Persist changes of a loaded value. Unchanged (`Stored`) content stays
    /// with the provider that owns it; new bytes are routed by size.
    pub async fn update_binary_property(&self, value: &mut BinaryDataValue) -> Result<()> {
        let provider = match &value.stream {
            Some(BinaryContent::Stored) => {
                self.selector.get_provider(value.blob_provider_name.as_deref())?
            }
            _ => self.selector.select_provider(value.stream_length()),
        };
        self.store.update_binary_property(&provider, value).await
    }

    pub async fn delete_binary_property(&self, version_id: i64, property_type_id: i64) -> Result<()> {
        self.store.delete_binary_property(version_id, property_type_id).await
    }

    pub async fn delete_binary_properties(&self, version_ids: &[i64]) -> Result<u64> {
        self.store.delete_binary_properties(version_ids).await
    }

    pub async fn load_binary_property(
        &self,
        version_id: i64,
        property_type_id: i64,
    ) -> Result<Option<BinaryDataValue>> {
        self.store.load_binary_property(version_id, property_type_id).await
    }

    pub async fn load_binary_cache_entity(
        &self,
        version_id: i64,
        property_type_id: i64,
    ) -> Result<Option<BinaryCacheEntity>> {
        let Some(row) = self
            .store
            .load_binary_cache_entity(version_id, property_type_id)
            .await?
        else {
            return Ok(None);
        };

        let context = self
            .selector
            .create_context(
                row.file_id,
                row.size,
                row.blob_provider.as_deref(),
                row.blob_provider_data.as_deref(),
            )?
            .with_owner(version_id, property_type_id);

        Ok(Some(BinaryCacheEntity {
            length: row.size,
            raw_data: row.stream,
            binary_property_id: row.binary_property_id,
            file_id: row.file_id,
            context,
        }))
    }

    /// Context of a committed file row
    pub async fn get_blob_storage_context(&self, file_id: i64) -> Result<BlobStorageContext> {
        let record = self
            .store
            .load_file_record(file_id)
            .await?
            .filter(|record| !record.staging)
            .ok_or_else(|| BlobStorageError::NotFound(format!("file {}", file_id)))?;

        self.selector.create_context(
            record.file_id,
            record.size,
            record.blob_provider.as_deref(),
            record.blob_provider_data.as_deref(),
        )
    }

    /// Readable stream over the live content of a property; cached bytes are
    /// served from memory.
    pub async fn get_stream_for_read(
        &self,
        version_id: i64,
        property_type_id: i64,
    ) -> Result<Option<BlobReadStream>> {
        let Some(entity) = self
            .load_binary_cache_entity(version_id, property_type_id)
            .await?
        else {
            return Ok(None);
        };

        if let Some(raw) = entity.raw_data {
            if raw.len() as i64 == entity.length {
                return Ok(Some(Box::new(Cursor::new(raw))));
            }
        }

        let stream = entity
            .context
            .provider
            .provider()
            .get_stream_for_read(&entity.context)
            .await?;
        Ok(Some(stream))
    }

    /// Readable stream over a committed file row
    pub async fn get_stream_for_file(&self, file_id: i64) -> Result<BlobReadStream> {
        let ctx = self.get_blob_storage_context(file_id).await?;
        ctx.provider.provider().get_stream_for_read(&ctx).await
    }

    /// Open a chunked upload and return its sealed token
    pub async fn start_chunk(&self, version_id: i64, property_type_id: i64, full_size: i64) -> Result<String> {
        let provider = self.selector.select_provider(full_size);
        let token = self
            .store
            .start_chunk(&provider, version_id, property_type_id, full_size)
            .await?;
        self.tokens.encode(&token)
    }

    /// Write one chunk of an open upload. Chunks may arrive in any order.
    pub async fn write_chunk(
        &self,
        version_id: i64,
        token: &str,
        buffer: &[u8],
        offset: i64,
        full_size: i64,
    ) -> Result<()> {
        let token = self.open_token(version_id, token)?;

        let end = i64::try_from(buffer.len())
            .ok()
            .and_then(|len| offset.checked_add(len));
        if offset < 0 || end.map_or(true, |end| end > full_size) {
            return Err(BlobStorageError::InvalidArgument(format!(
                "chunk of {} bytes at offset {} does not fit in {} bytes",
                buffer.len(),
                offset,
                full_size
            )));
        }

        let record = self
            .store
            .load_staging_file(token.file_id, token.version_id, token.property_type_id)
            .await?;
        let ctx = self
            .selector
            .create_context(
                record.file_id,
                full_size,
                record.blob_provider.as_deref(),
                record.blob_provider_data.as_deref(),
            )?
            .with_owner(token.version_id, token.property_type_id);

        ctx.provider
            .provider()
            .write(&ctx, offset, buffer)
            .await
            .map_err(|e| e.context(format!("Failed to write chunk at offset {}", offset)))
    }

    pub async fn commit_chunk(
        &self,
        version_id: i64,
        property_type_id: i64,
        file_id: i64,
        full_size: i64,
        source: Option<&BinaryDataValue>,
    ) -> Result<()> {
        self.store
            .commit_chunk(version_id, property_type_id, file_id, full_size, source)
            .await
    }

    /// Commit an upload identified by its sealed token
    pub async fn commit_chunk_with_token(
        &self,
        version_id: i64,
        token: &str,
        full_size: i64,
        source: Option<&BinaryDataValue>,
    ) -> Result<()> {
        let token = self.open_token(version_id, token)?;
        self.commit_chunk(
            token.version_id,
            token.property_type_id,
            token.file_id,
            full_size,
            source,
        )
        .await
    }

    /// Feed a whole reader into an open upload, one buffer per chunk.
    /// Returns the number of bytes written.
    pub async fn copy_from_stream<R>(
        &self,
        version_id: i64,
        token: &str,
        full_size: i64,
        source: &mut R,
    ) -> Result<i64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; self.buffer_size];
        let mut offset = 0i64;

        loop {
            let read = read_full(source, &mut buffer).await?;
            if read == 0 {
                break;
            }
            self.write_chunk(version_id, token, &buffer[..read], offset, full_size)
                .await?;
            offset += read as i64;
        }

        tracing::debug!("Copied {} bytes into chunked upload", offset);
        Ok(offset)
    }

    fn open_token(&self, version_id: i64, token: &str) -> Result<ChunkToken> {
        let token = self.tokens.decode(token)?;
        if token.version_id != version_id {
            return Err(BlobStorageError::ChunkAccessDenied(format!(
                "token was issued for version {}, not {}",
                token.version_id, version_id
            )));
        }
        Ok(token)
    }
}

/// Fill `buffer` unless the reader ends first
async fn read_full<R>(source: &mut R, buffer: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let read = source.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
