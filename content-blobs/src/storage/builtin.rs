//! Built-in blob provider
//!
//! Stores bytes in the `Files.Stream` column of the metadata database. The
//! database row is the allocation, so there is nothing to allocate, clear or
//! delete here; writes are byte-range updates of the row.

use crate::config::MAX_BUILT_IN_STREAM_LENGTH;
use crate::database::chunks;
use crate::error::{BlobStorageError, Result};
use crate::storage::provider::{
    BlobProvider, BlobReadStream, BlobStorageContext, BlobWriteStream, ProviderData,
};
use crate::storage::read_stream::{BinaryReadStream, FragmentReader};
use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;

pub const BUILT_IN_PROVIDER_NAME: &str = "BuiltInBlobProvider";

pub struct BuiltInBlobProvider {
    pool: SqlitePool,
    fragments: Arc<dyn FragmentReader>,
    buffer_size: usize,
}

impl BuiltInBlobProvider {
    pub fn new(pool: SqlitePool, fragments: Arc<dyn FragmentReader>, buffer_size: usize) -> Self {
        Self {
            pool,
            fragments,
            buffer_size,
        }
    }

    /// Reject lengths the single-write primitive cannot represent
    pub fn check_length(length: i64) -> Result<()> {
        if length > MAX_BUILT_IN_STREAM_LENGTH {
            return Err(BlobStorageError::NotSupported(format!(
                "the built-in provider cannot store {} bytes (limit {})",
                length, MAX_BUILT_IN_STREAM_LENGTH
            )));
        }
        Ok(())
    }

    /// Replace the whole stream of a file row inside the caller's transaction.
    /// Returns the row's new timestamp.
    pub async fn update_stream(conn: &mut SqliteConnection, file_id: i64, data: &[u8]) -> Result<i64> {
        Self::check_length(data.len() as i64)?;

        let timestamp: i64 = sqlx::query_scalar(
            r#"
            UPDATE Files SET Stream = ?, Size = ?, Timestamp = Timestamp + 1
            WHERE FileId = ? AND BlobProvider IS NULL
            RETURNING Timestamp
            "#,
        )
        .bind(data)
        .bind(data.len() as i64)
        .bind(file_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| BlobStorageError::NotFound(format!("built-in file row {}", file_id)))?;

        tracing::debug!("Stored {} bytes inline in file {}", data.len(), file_id);
        Ok(timestamp)
    }
}

#[async_trait]
impl BlobProvider for BuiltInBlobProvider {
    fn name(&self) -> &str {
        BUILT_IN_PROVIDER_NAME
    }

    fn parse_data(&self, _text: &str) -> Result<ProviderData> {
        Ok(ProviderData::BuiltIn)
    }

    async fn allocate(&self, _ctx: &mut BlobStorageContext) -> Result<()> {
        Err(BlobStorageError::NotSupported(
            "the built-in provider does not pre-allocate storage".to_string(),
        ))
    }

    /// Range write into a staging row; the staging claim is checked by the
    /// same statement that writes.
    async fn write(&self, ctx: &BlobStorageContext, offset: i64, buffer: &[u8]) -> Result<()> {
        if offset < 0 {
            return Err(BlobStorageError::InvalidArgument(format!(
                "negative write offset {}",
                offset
            )));
        }
        let end = i64::try_from(buffer.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(|| {
                BlobStorageError::InvalidArgument(format!(
                    "write of {} bytes at offset {} overflows",
                    buffer.len(),
                    offset
                ))
            })?;
        Self::check_length(end)?;

        let mut conn = self.pool.acquire().await?;
        chunks::write_staged_chunk(
            &mut conn,
            ctx.file_id,
            ctx.version_id,
            ctx.property_type_id,
            offset,
            buffer,
        )
        .await
    }

    async fn get_stream_for_read(&self, ctx: &BlobStorageContext) -> Result<BlobReadStream> {
        Ok(Box::new(BinaryReadStream::new(
            Arc::clone(&self.fragments),
            ctx.file_id,
            ctx.length.max(0) as u64,
            self.buffer_size,
        )))
    }

    async fn get_stream_for_write(&self, _ctx: &BlobStorageContext) -> Result<BlobWriteStream> {
        Err(BlobStorageError::NotSupported(
            "the built-in provider writes through byte-range updates only".to_string(),
        ))
    }

    async fn clear(&self, _ctx: &BlobStorageContext) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _ctx: &BlobStorageContext) -> Result<()> {
        Ok(())
    }
}
