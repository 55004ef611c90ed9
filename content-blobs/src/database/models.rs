//! Database models
//!
//! Rust structs representing the `Files` and `BinaryProperties` tables and
//! the values passed across the metadata store boundary.

use super::repository::calculate_checksum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One stored binary. The `Stream` column is never loaded through this type.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[sqlx(rename_all = "PascalCase")]
pub struct FileRecord {
    pub file_id: i64,
    pub content_type: String,
    pub file_name_without_extension: Option<String>,
    pub extension: String,
    pub size: i64,
    pub checksum: Option<String>,
    /// `None` for rows owned by the built-in provider
    pub blob_provider: Option<String>,
    pub blob_provider_data: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub timestamp: i64,
    pub is_deleted: bool,
    pub staging: bool,
    pub staging_version_id: Option<i64>,
    pub staging_property_type_id: Option<i64>,
}

/// A binary property joined with its committed file row
#[derive(Debug, Clone, FromRow)]
#[sqlx(rename_all = "PascalCase")]
pub struct BinaryPropertyRow {
    pub binary_property_id: i64,
    pub version_id: i64,
    pub property_type_id: i64,
    pub file_id: i64,
    pub content_type: String,
    pub file_name_without_extension: Option<String>,
    pub extension: String,
    pub size: i64,
    pub checksum: Option<String>,
    pub blob_provider: Option<String>,
    pub blob_provider_data: Option<String>,
    pub timestamp: i64,
}

/// Cache lookup result; `Stream` is only selected below the cache ceiling
#[derive(Debug, Clone, FromRow)]
#[sqlx(rename_all = "PascalCase")]
pub struct CacheEntityRow {
    pub size: i64,
    pub binary_property_id: i64,
    pub file_id: i64,
    pub blob_provider: Option<String>,
    pub blob_provider_data: Option<String>,
    pub stream: Option<Vec<u8>>,
}

/// A row removed by the cleanup drain
#[derive(Debug, Clone, FromRow)]
#[sqlx(rename_all = "PascalCase")]
pub struct DeletedFileRow {
    pub file_id: i64,
    pub size: i64,
    pub blob_provider: Option<String>,
    pub blob_provider_data: Option<String>,
}

/// Content carried by a [`BinaryDataValue`] on its way to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryContent {
    /// The bytes already persisted for this value. Only metadata is written.
    Stored,
    /// New bytes replacing the stored content.
    Bytes(Vec<u8>),
}

/// The binary value of one content property
#[derive(Debug, Clone, Default)]
pub struct BinaryDataValue {
    /// BinaryPropertyId
    pub id: i64,
    pub file_id: i64,
    pub size: i64,
    pub checksum: Option<String>,
    pub content_type: String,
    pub file_name: String,
    pub extension: String,
    pub blob_provider_name: Option<String>,
    pub blob_provider_data: Option<String>,
    pub timestamp: i64,
    /// `None` means the content was neither loaded nor modified.
    pub stream: Option<BinaryContent>,
}

impl BinaryDataValue {
    /// New value carrying fresh bytes
    pub fn from_bytes(
        file_name: impl Into<String>,
        extension: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            size: data.len() as i64,
            content_type: content_type.into(),
            file_name: file_name.into(),
            extension: extension.into(),
            stream: Some(BinaryContent::Bytes(data)),
            ..Self::default()
        }
    }

    /// Length of the content about to be written
    pub fn stream_length(&self) -> i64 {
        match &self.stream {
            Some(BinaryContent::Bytes(data)) => data.len() as i64,
            Some(BinaryContent::Stored) => self.size,
            None => 0,
        }
    }

    /// Recompute size and checksum from the carried bytes
    pub fn digest_bytes(&mut self) {
        if let Some(BinaryContent::Bytes(data)) = &self.stream {
            self.size = data.len() as i64;
            self.checksum = Some(calculate_checksum(data));
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.stream {
            Some(BinaryContent::Bytes(data)) => Some(data),
            _ => None,
        }
    }
}

impl From<BinaryPropertyRow> for BinaryDataValue {
    fn from(row: BinaryPropertyRow) -> Self {
        Self {
            id: row.binary_property_id,
            file_id: row.file_id,
            size: row.size,
            checksum: row.checksum,
            content_type: row.content_type,
            file_name: row.file_name_without_extension.unwrap_or_default(),
            extension: row.extension,
            blob_provider_name: row.blob_provider,
            blob_provider_data: row.blob_provider_data,
            timestamp: row.timestamp,
            stream: None,
        }
    }
}

/// Result of an insert through the metadata store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// An existing binary was replaced; its file row is now orphaned and the
    /// caller should run an orphan cleanup once its own transaction commits.
    pub needs_file_cleanup: bool,
}

/// Correlation handle of one chunked upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkToken {
    pub version_id: i64,
    pub property_type_id: i64,
    pub binary_property_id: i64,
    pub file_id: i64,
}
