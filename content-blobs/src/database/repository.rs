//! Metadata store
//!
//! Owns the `Files` and `BinaryProperties` tables. Every mutation that must be
//! atomic with a read runs in one transaction; provider I/O for external
//! stores happens before the transaction opens so no connection is held
//! across a network round trip.

use super::models::*;
use crate::error::{BlobStorageError, Result};
use crate::storage::builtin::BuiltInBlobProvider;
use crate::storage::provider::{BlobStorageContext, ProviderHandle};
use crate::storage::read_stream::FragmentReader;
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::io::AsyncWriteExt;

/// Repository for binary metadata
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
    binary_cache_size: i64,
}

/// Placement of the file row an update targets
#[derive(Debug, sqlx::FromRow)]
#[sqlx(rename_all = "PascalCase")]
struct CurrentFile {
    file_id: i64,
    shared: bool,
    blob_provider: Option<String>,
    blob_provider_data: Option<String>,
    size: i64,
}

impl MetadataStore {
    pub fn new(pool: SqlitePool, binary_cache_size: i64) -> Self {
        Self {
            pool,
            binary_cache_size,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn binary_cache_size(&self) -> i64 {
        self.binary_cache_size
    }

    /// Store a new binary and link it to `version_id`/`property_type_id`.
    ///
    /// External content is allocated and written before the file row exists;
    /// built-in content is written into the row right after it is inserted.
    /// With `is_new_node == false` an existing link for the slot is replaced.
    pub async fn insert_binary_property(
        &self,
        provider: &ProviderHandle,
        value: &mut BinaryDataValue,
        version_id: i64,
        property_type_id: i64,
        is_new_node: bool,
    ) -> Result<InsertOutcome> {
        let stream_length = value.stream_length();
        let mut ctx =
            BlobStorageContext::new(provider.clone(), version_id, property_type_id, 0, stream_length);

        if provider.is_built_in() {
            BuiltInBlobProvider::check_length(stream_length)?;
            value.blob_provider_name = None;
            value.blob_provider_data = None;
        } else {
            self.write_external(&mut ctx, value.bytes()).await?;
            value.blob_provider_name = provider.stored_name();
            value.blob_provider_data = ctx.stored_provider_data()?;
        }

        value.digest_bytes();

        match self
            .insert_rows(provider, value, version_id, property_type_id, is_new_node)
            .await
        {
            Ok(replaced) => {
                tracing::debug!(
                    "Inserted binary property {} (file {}, provider {})",
                    value.id,
                    value.file_id,
                    provider.name()
                );
                Ok(InsertOutcome {
                    needs_file_cleanup: replaced,
                })
            }
            Err(e) => {
                self.discard_allocation(&ctx).await;
                Err(e.context("Failed to insert binary property"))
            }
        }
    }

    async fn insert_rows(
        &self,
        provider: &ProviderHandle,
        value: &mut BinaryDataValue,
        version_id: i64,
        property_type_id: i64,
        is_new_node: bool,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let mut replaced = false;
        if !is_new_node {
            replaced = sqlx::query(
                "DELETE FROM BinaryProperties WHERE VersionId = ? AND PropertyTypeId = ?",
            )
            .bind(version_id)
            .bind(property_type_id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                > 0;
        }

        let initial_stream: Option<Vec<u8>> = provider.is_built_in().then(Vec::new);

        let (file_id, mut timestamp): (i64, i64) = sqlx::query_as(
            r#"
            INSERT INTO Files (ContentType, FileNameWithoutExtension, Extension, Size, Checksum,
                               BlobProvider, BlobProviderData, Stream, CreationDate)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING FileId, Timestamp
            "#,
        )
        .bind(&value.content_type)
        .bind(&value.file_name)
        .bind(&value.extension)
        .bind(value.size)
        .bind(&value.checksum)
        .bind(&value.blob_provider_name)
        .bind(&value.blob_provider_data)
        .bind(initial_stream)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        let binary_property_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO BinaryProperties (VersionId, PropertyTypeId, FileId)
            VALUES (?, ?, ?)
            RETURNING BinaryPropertyId
            "#,
        )
        .bind(version_id)
        .bind(property_type_id)
        .bind(file_id)
        .fetch_one(&mut *tx)
        .await?;

        if provider.is_built_in() {
            if let Some(data) = value.bytes().filter(|data| !data.is_empty()) {
                timestamp = BuiltInBlobProvider::update_stream(&mut tx, file_id, data).await?;
            }
        }

        tx.commit().await?;

        value.id = binary_property_id;
        value.file_id = file_id;
        value.timestamp = timestamp;
        Ok(replaced)
    }

    /// Persist a modified binary value.
    ///
    /// `None` content is a no-op. A new file row is written instead of
    /// mutating the current one when that row is shared with another link, or
    /// when built-in content replaces externally addressed content.
    pub async fn update_binary_property(
        &self,
        provider: &ProviderHandle,
        value: &mut BinaryDataValue,
    ) -> Result<()> {
        if value.stream.is_none() {
            tracing::debug!("Binary property {} unchanged, nothing to write", value.id);
            return Ok(());
        }

        let result = if provider.is_built_in() {
            self.update_built_in(value).await
        } else if value.bytes().is_some() {
            self.update_external_bytes(provider, value).await
        } else {
            self.update_external_stored(provider, value).await
        };

        result.map_err(|e| e.context(format!("Failed to update binary property {}", value.id)))
    }

    async fn update_built_in(&self, value: &mut BinaryDataValue) -> Result<()> {
        BuiltInBlobProvider::check_length(value.stream_length())?;
        value.digest_bytes();

        let mut tx = self.pool.begin().await?;
        let current = Self::current_file(&mut tx, value.id).await?;
        let was_external = current.blob_provider.is_some();
        if value.bytes().is_none() {
            value.size = current.size;
        }

        if value.bytes().is_none() && was_external {
            return Err(BlobStorageError::InvalidArgument(format!(
                "stored content of file {} belongs to provider {:?} and cannot be moved inline",
                current.file_id, current.blob_provider
            )));
        }

        let (file_id, mut timestamp) = if current.shared || was_external {
            let (file_id, timestamp): (i64, i64) = match value.bytes() {
                Some(_) => {
                    sqlx::query_as(
                        r#"
                        INSERT INTO Files (ContentType, FileNameWithoutExtension, Extension, Size,
                                           Checksum, Stream, CreationDate)
                        VALUES (?, ?, ?, ?, ?, x'', ?)
                        RETURNING FileId, Timestamp
                        "#,
                    )
                    .bind(&value.content_type)
                    .bind(&value.file_name)
                    .bind(&value.extension)
                    .bind(value.size)
                    .bind(&value.checksum)
                    .bind(Utc::now())
                    .fetch_one(&mut *tx)
                    .await?
                }
                None => {
                    sqlx::query_as(
                        r#"
                        INSERT INTO Files (ContentType, FileNameWithoutExtension, Extension, Size,
                                           Checksum, Stream, CreationDate)
                        SELECT ?, ?, ?, Size, ?, Stream, ? FROM Files WHERE FileId = ?
                        RETURNING FileId, Timestamp
                        "#,
                    )
                    .bind(&value.content_type)
                    .bind(&value.file_name)
                    .bind(&value.extension)
                    .bind(&value.checksum)
                    .bind(Utc::now())
                    .bind(current.file_id)
                    .fetch_one(&mut *tx)
                    .await?
                }
            };

            Self::relink(&mut tx, value.id, file_id).await?;
            tracing::debug!(
                "Copy-on-write for binary property {}: file {} -> {}",
                value.id,
                current.file_id,
                file_id
            );
            (file_id, timestamp)
        } else {
            let timestamp: i64 = sqlx::query_scalar(
                r#"
                UPDATE Files
                SET ContentType = ?, FileNameWithoutExtension = ?, Extension = ?, Size = ?,
                    Checksum = ?, Timestamp = Timestamp + 1
                WHERE FileId = ?
                RETURNING Timestamp
                "#,
            )
            .bind(&value.content_type)
            .bind(&value.file_name)
            .bind(&value.extension)
            .bind(value.size)
            .bind(&value.checksum)
            .bind(current.file_id)
            .fetch_one(&mut *tx)
            .await?;
            (current.file_id, timestamp)
        };

        if let Some(data) = value.bytes() {
            timestamp = BuiltInBlobProvider::update_stream(&mut tx, file_id, data).await?;
        }

        tx.commit().await?;

        value.file_id = file_id;
        value.timestamp = timestamp;
        value.blob_provider_name = None;
        value.blob_provider_data = None;
        Ok(())
    }

    /// New bytes for an external provider always land in a fresh location.
    async fn update_external_bytes(
        &self,
        provider: &ProviderHandle,
        value: &mut BinaryDataValue,
    ) -> Result<()> {
        let mut ctx = BlobStorageContext::new(provider.clone(), 0, 0, 0, value.stream_length());
        self.write_external(&mut ctx, value.bytes()).await?;

        value.digest_bytes();
        value.blob_provider_name = provider.stored_name();
        value.blob_provider_data = ctx.stored_provider_data()?;

        match self.insert_linked_external_row(value).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.discard_allocation(&ctx).await;
                Err(e)
            }
        }
    }

    /// Metadata-only update of externally stored content; a shared location
    /// is copied first so the sibling link keeps its bytes.
    async fn update_external_stored(
        &self,
        provider: &ProviderHandle,
        value: &mut BinaryDataValue,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current = Self::current_file(&mut tx, value.id).await?;

        if !current.shared {
            let timestamp: i64 = sqlx::query_scalar(
                r#"
                UPDATE Files
                SET ContentType = ?, FileNameWithoutExtension = ?, Extension = ?,
                    Checksum = COALESCE(?, Checksum), Timestamp = Timestamp + 1
                WHERE FileId = ?
                RETURNING Timestamp
                "#,
            )
            .bind(&value.content_type)
            .bind(&value.file_name)
            .bind(&value.extension)
            .bind(&value.checksum)
            .bind(current.file_id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;

            value.file_id = current.file_id;
            value.size = current.size;
            value.timestamp = timestamp;
            value.blob_provider_name = current.blob_provider;
            value.blob_provider_data = current.blob_provider_data;
            return Ok(());
        }

        // The copy talks to the provider, so no transaction stays open for it
        tx.rollback().await?;

        let source = BlobStorageContext::from_stored(
            provider.clone(),
            current.file_id,
            current.size,
            current.blob_provider_data.as_deref(),
        )?;
        let mut target = BlobStorageContext::new(provider.clone(), 0, 0, 0, current.size);
        provider.provider().allocate(&mut target).await?;

        let copied = async {
            let mut reader = provider.provider().get_stream_for_read(&source).await?;
            let mut writer = provider.provider().get_stream_for_write(&target).await?;
            tokio::io::copy(&mut reader, &mut writer).await?;
            writer.shutdown().await?;
            Ok::<_, BlobStorageError>(())
        }
        .await;

        if let Err(e) = copied {
            self.discard_allocation(&target).await;
            return Err(e);
        }

        value.size = current.size;
        value.blob_provider_name = provider.stored_name();
        value.blob_provider_data = target.stored_provider_data()?;

        match self.insert_linked_external_row(value).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.discard_allocation(&target).await;
                Err(e)
            }
        }
    }

    async fn insert_linked_external_row(&self, value: &mut BinaryDataValue) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::current_file(&mut tx, value.id).await?;

        let (file_id, timestamp): (i64, i64) = sqlx::query_as(
            r#"
            INSERT INTO Files (ContentType, FileNameWithoutExtension, Extension, Size, Checksum,
                               BlobProvider, BlobProviderData, CreationDate)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING FileId, Timestamp
            "#,
        )
        .bind(&value.content_type)
        .bind(&value.file_name)
        .bind(&value.extension)
        .bind(value.size)
        .bind(&value.checksum)
        .bind(&value.blob_provider_name)
        .bind(&value.blob_provider_data)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        Self::relink(&mut tx, value.id, file_id).await?;
        tx.commit().await?;

        value.file_id = file_id;
        value.timestamp = timestamp;
        Ok(())
    }

    async fn current_file(conn: &mut SqliteConnection, binary_property_id: i64) -> Result<CurrentFile> {
        sqlx::query_as::<_, CurrentFile>(
            r#"
            SELECT B.FileId,
                   EXISTS (SELECT 1 FROM BinaryProperties O
                           WHERE O.FileId = B.FileId
                             AND O.BinaryPropertyId <> B.BinaryPropertyId) AS Shared,
                   F.BlobProvider, F.BlobProviderData, F.Size
            FROM BinaryProperties B
            JOIN Files F ON F.FileId = B.FileId
            WHERE B.BinaryPropertyId = ?
            "#,
        )
        .bind(binary_property_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| BlobStorageError::NotFound(format!("binary property {}", binary_property_id)))
    }

    async fn relink(conn: &mut SqliteConnection, binary_property_id: i64, file_id: i64) -> Result<()> {
        sqlx::query("UPDATE BinaryProperties SET FileId = ? WHERE BinaryPropertyId = ?")
            .bind(file_id)
            .bind(binary_property_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Remove the link of one property; the file row is left for cleanup.
    pub async fn delete_binary_property(&self, version_id: i64, property_type_id: i64) -> Result<()> {
        let rows = sqlx::query(
            "DELETE FROM BinaryProperties WHERE VersionId = ? AND PropertyTypeId = ?",
        )
        .bind(version_id)
        .bind(property_type_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BlobStorageError::from(e).context("Failed to delete binary property"))?
        .rows_affected();

        tracing::debug!(
            "Deleted {} binary property link(s) of version {} property type {}",
            rows,
            version_id,
            property_type_id
        );
        Ok(())
    }

    /// Remove every link owned by the given versions.
    pub async fn delete_binary_properties(&self, version_ids: &[i64]) -> Result<u64> {
        if version_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; version_ids.len()].join(", ");
        let query = format!(
            "DELETE FROM BinaryProperties WHERE VersionId IN ({})",
            placeholders
        );

        let mut q = sqlx::query(&query);
        for version_id in version_ids {
            q = q.bind(version_id);
        }

        let rows = q
            .execute(&self.pool)
            .await
            .map_err(|e| BlobStorageError::from(e).context("Failed to delete binary properties"))?
            .rows_affected();

        tracing::debug!("Deleted {} binary property link(s) of {} version(s)", rows, version_ids.len());
        Ok(rows)
    }

    /// Committed binary metadata of one property, without content
    pub async fn load_binary_property(
        &self,
        version_id: i64,
        property_type_id: i64,
    ) -> Result<Option<BinaryDataValue>> {
        let row = sqlx::query_as::<_, BinaryPropertyRow>(
            r#"
            SELECT B.BinaryPropertyId, B.VersionId, B.PropertyTypeId, F.FileId, F.ContentType,
                   F.FileNameWithoutExtension, F.Extension, F.Size, F.Checksum,
                   F.BlobProvider, F.BlobProviderData, F.Timestamp
            FROM BinaryProperties B
            JOIN Files F ON F.FileId = B.FileId
            WHERE B.VersionId = ? AND B.PropertyTypeId = ? AND F.Staging = 0
            "#,
        )
        .bind(version_id)
        .bind(property_type_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(BinaryDataValue::from))
    }

    /// Committed binaries of several versions at once
    pub async fn load_binary_properties(&self, version_ids: &[i64]) -> Result<Vec<BinaryPropertyRow>> {
        if version_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; version_ids.len()].join(", ");
        let query = format!(
            r#"
            SELECT B.BinaryPropertyId, B.VersionId, B.PropertyTypeId, F.FileId, F.ContentType,
                   F.FileNameWithoutExtension, F.Extension, F.Size, F.Checksum,
                   F.BlobProvider, F.BlobProviderData, F.Timestamp
            FROM BinaryProperties B
            JOIN Files F ON F.FileId = B.FileId
            WHERE B.VersionId IN ({}) AND F.Staging = 0
            ORDER BY B.VersionId, B.PropertyTypeId
            "#,
            placeholders
        );

        let mut q = sqlx::query_as::<_, BinaryPropertyRow>(&query);
        for version_id in version_ids {
            q = q.bind(version_id);
        }

        Ok(q.fetch_all(&self.pool).await?)
    }

    /// Metadata plus inline bytes when the binary is below the cache ceiling.
    /// Larger streams are never selected.
    pub async fn load_binary_cache_entity(
        &self,
        version_id: i64,
        property_type_id: i64,
    ) -> Result<Option<CacheEntityRow>> {
        let row = sqlx::query_as::<_, CacheEntityRow>(
            r#"
            SELECT F.Size, B.BinaryPropertyId, F.FileId, F.BlobProvider, F.BlobProviderData,
                   CASE WHEN F.Size < ?3 THEN F.Stream ELSE NULL END AS Stream
            FROM BinaryProperties B
            JOIN Files F ON F.FileId = B.FileId
            WHERE B.VersionId = ?1 AND B.PropertyTypeId = ?2 AND F.Staging = 0
            "#,
        )
        .bind(version_id)
        .bind(property_type_id)
        .bind(self.binary_cache_size)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn load_file_record(&self, file_id: i64) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT FileId, ContentType, FileNameWithoutExtension, Extension, Size, Checksum,
                   BlobProvider, BlobProviderData, CreationDate, Timestamp, IsDeleted,
                   Staging, StagingVersionId, StagingPropertyTypeId
            FROM Files WHERE FileId = ?
            "#,
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Read up to `count` bytes of a built-in row starting at `position`
    pub async fn load_binary_fragment(&self, file_id: i64, position: u64, count: usize) -> Result<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let fragment: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT substr(Stream, ?, ?) FROM Files WHERE FileId = ?")
                .bind(position as i64 + 1)
                .bind(count as i64)
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| BlobStorageError::NotFound(format!("file {}", file_id)))?;

        Ok(fragment.unwrap_or_default())
    }

    /// Allocate a location and write `data` into it
    async fn write_external(&self, ctx: &mut BlobStorageContext, data: Option<&[u8]>) -> Result<()> {
        let provider = ctx.provider.clone();
        provider
            .provider()
            .allocate(ctx)
            .await
            .map_err(|e| e.context(format!("Failed to allocate storage in {}", provider.name())))?;

        if let Some(data) = data.filter(|data| !data.is_empty()) {
            if let Err(e) = provider.provider().write(ctx, 0, data).await {
                self.discard_allocation(ctx).await;
                return Err(e.context(format!("Failed to write to {}", provider.name())));
            }
        }

        tracing::debug!("Allocated external blob in {}", provider.name());
        Ok(())
    }

    /// Best-effort release of an external location whose row never committed.
    /// Anything left behind is unreachable and harmless.
    pub(crate) async fn discard_allocation(&self, ctx: &BlobStorageContext) {
        if ctx.provider.is_built_in() || ctx.stored_provider_data().ok().flatten().is_none() {
            return;
        }
        if let Err(e) = ctx.provider.provider().delete(ctx).await {
            tracing::warn!(
                "Failed to release unused allocation in {}: {}",
                ctx.provider.name(),
                e
            );
        }
    }
}

#[async_trait]
impl FragmentReader for MetadataStore {
    async fn read_fragment(&self, file_id: i64, offset: u64, count: usize) -> Result<Vec<u8>> {
        self.load_binary_fragment(file_id, offset, count).await
    }
}

/// Calculate SHA-256 hash of data
pub fn calculate_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    format!("{:x}", result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;
    use crate::storage::local::LocalBlobProvider;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_store() -> (MetadataStore, ProviderHandle) {
        let pool = memory_pool().await;
        let store = MetadataStore::new(pool.clone(), 100);
        let built_in = BuiltInBlobProvider::new(pool, Arc::new(store.clone()), 16);
        (store, ProviderHandle::BuiltIn(Arc::new(built_in)))
    }

    fn text_value(text: &str) -> BinaryDataValue {
        BinaryDataValue::from_bytes("readme", ".txt", "text/plain", text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_insert_and_load_built_in() {
        let (store, built_in) = create_store().await;
        let mut value = text_value("hello");

        let outcome = store
            .insert_binary_property(&built_in, &mut value, 10, 1, true)
            .await
            .unwrap();

        assert!(!outcome.needs_file_cleanup);
        assert!(value.id > 0);
        assert!(value.file_id > 0);
        assert_eq!(value.checksum.as_deref(), Some(calculate_checksum(b"hello").as_str()));

        let loaded = store.load_binary_property(10, 1).await.unwrap().unwrap();
        assert_eq!(loaded.file_id, value.file_id);
        assert_eq!(loaded.size, 5);
        assert_eq!(loaded.timestamp, value.timestamp);
        assert!(loaded.blob_provider_name.is_none());

        let bytes = store.load_binary_fragment(value.file_id, 0, 100).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn test_insert_empty_binary() {
        let (store, built_in) = create_store().await;
        let mut value = text_value("");

        store
            .insert_binary_property(&built_in, &mut value, 10, 1, true)
            .await
            .unwrap();

        let entity = store.load_binary_cache_entity(10, 1).await.unwrap().unwrap();
        assert_eq!(entity.size, 0);
        assert!(entity.stream.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_replace_existing_link() {
        let (store, built_in) = create_store().await;
        let mut first = text_value("one");
        store
            .insert_binary_property(&built_in, &mut first, 10, 1, true)
            .await
            .unwrap();

        let mut second = text_value("two");
        let outcome = store
            .insert_binary_property(&built_in, &mut second, 10, 1, false)
            .await
            .unwrap();

        assert!(outcome.needs_file_cleanup);
        let loaded = store.load_binary_property(10, 1).await.unwrap().unwrap();
        assert_eq!(loaded.file_id, second.file_id);
        assert_ne!(first.file_id, second.file_id);
    }

    #[tokio::test]
    async fn test_update_in_place() {
        let (store, built_in) = create_store().await;
        let mut value = text_value("before");
        store
            .insert_binary_property(&built_in, &mut value, 10, 1, true)
            .await
            .unwrap();
        let file_id = value.file_id;
        let timestamp = value.timestamp;

        value.stream = Some(BinaryContent::Bytes(b"after!".to_vec()));
        store.update_binary_property(&built_in, &mut value).await.unwrap();

        assert_eq!(value.file_id, file_id);
        assert!(value.timestamp > timestamp);
        let bytes = store.load_binary_fragment(file_id, 0, 100).await.unwrap();
        assert_eq!(bytes, b"after!");
    }

    #[tokio::test]
    async fn test_update_without_content_is_noop() {
        let (store, built_in) = create_store().await;
        let mut value = text_value("same");
        store
            .insert_binary_property(&built_in, &mut value, 10, 1, true)
            .await
            .unwrap();

        let mut loaded = store.load_binary_property(10, 1).await.unwrap().unwrap();
        loaded.content_type = "application/octet-stream".to_string();
        store.update_binary_property(&built_in, &mut loaded).await.unwrap();

        let reloaded = store.load_binary_property(10, 1).await.unwrap().unwrap();
        assert_eq!(reloaded.content_type, "text/plain");
        assert_eq!(reloaded.timestamp, value.timestamp);
    }

    #[tokio::test]
    async fn test_metadata_only_update() {
        let (store, built_in) = create_store().await;
        let mut value = text_value("keep me");
        store
            .insert_binary_property(&built_in, &mut value, 10, 1, true)
            .await
            .unwrap();

        let mut loaded = store.load_binary_property(10, 1).await.unwrap().unwrap();
        loaded.file_name = "renamed".to_string();
        loaded.stream = Some(BinaryContent::Stored);
        store.update_binary_property(&built_in, &mut loaded).await.unwrap();

        let reloaded = store.load_binary_property(10, 1).await.unwrap().unwrap();
        assert_eq!(reloaded.file_name, "renamed");
        assert_eq!(reloaded.size, 7);
        let bytes = store.load_binary_fragment(reloaded.file_id, 0, 100).await.unwrap();
        assert_eq!(bytes, b"keep me");
    }

    #[tokio::test]
    async fn test_copy_on_write_for_shared_file() {
        let (store, built_in) = create_store().await;
        let mut value = text_value("shared");
        store
            .insert_binary_property(&built_in, &mut value, 10, 1, true)
            .await
            .unwrap();

        // A second version shares the same file row
        sqlx::query("INSERT INTO BinaryProperties (VersionId, PropertyTypeId, FileId) VALUES (11, 1, ?)")
            .bind(value.file_id)
            .execute(store.pool())
            .await
            .unwrap();

        let mut sibling = store.load_binary_property(11, 1).await.unwrap().unwrap();
        sibling.stream = Some(BinaryContent::Bytes(b"changed".to_vec()));
        store.update_binary_property(&built_in, &mut sibling).await.unwrap();

        assert_ne!(sibling.file_id, value.file_id);
        let original = store.load_binary_fragment(value.file_id, 0, 100).await.unwrap();
        let changed = store.load_binary_fragment(sibling.file_id, 0, 100).await.unwrap();
        assert_eq!(original, b"shared");
        assert_eq!(changed, b"changed");
    }

    fn local_handle(temp: &TempDir) -> ProviderHandle {
        ProviderHandle::External(Arc::new(LocalBlobProvider::new(temp.path().to_path_buf())))
    }

    #[tokio::test]
    async fn test_external_metadata_update_in_place() {
        let (store, _) = create_store().await;
        let temp = TempDir::new().unwrap();
        let local = local_handle(&temp);
        let mut value = text_value("external");
        store
            .insert_binary_property(&local, &mut value, 10, 1, true)
            .await
            .unwrap();

        let mut loaded = store.load_binary_property(10, 1).await.unwrap().unwrap();
        loaded.file_name = "renamed".to_string();
        loaded.stream = Some(BinaryContent::Stored);
        store.update_binary_property(&local, &mut loaded).await.unwrap();

        assert_eq!(loaded.file_id, value.file_id);
        assert_eq!(loaded.blob_provider_data, value.blob_provider_data);
        let reloaded = store.load_binary_property(10, 1).await.unwrap().unwrap();
        assert_eq!(reloaded.file_name, "renamed");
        assert!(reloaded.timestamp > value.timestamp);
    }

    #[tokio::test]
    async fn test_external_metadata_update_of_shared_file_copies() {
        let (store, _) = create_store().await;
        let temp = TempDir::new().unwrap();
        let local = local_handle(&temp);
        let mut value = text_value("external");
        store
            .insert_binary_property(&local, &mut value, 10, 1, true)
            .await
            .unwrap();
        sqlx::query("INSERT INTO BinaryProperties (VersionId, PropertyTypeId, FileId) VALUES (11, 1, ?)")
            .bind(value.file_id)
            .execute(store.pool())
            .await
            .unwrap();

        let mut sibling = store.load_binary_property(11, 1).await.unwrap().unwrap();
        sibling.file_name = "sibling".to_string();
        sibling.stream = Some(BinaryContent::Stored);
        store.update_binary_property(&local, &mut sibling).await.unwrap();

        assert_ne!(sibling.file_id, value.file_id);
        assert_ne!(sibling.blob_provider_data, value.blob_provider_data);
        let original = store.load_binary_property(10, 1).await.unwrap().unwrap();
        assert_eq!(original.file_id, value.file_id);
        assert_eq!(original.file_name, "readme");
    }

    #[tokio::test]
    async fn test_cache_entity_respects_ceiling() {
        let (store, built_in) = create_store().await;
        let mut small = BinaryDataValue::from_bytes("small", ".bin", "application/octet-stream", vec![1; 99]);
        let mut large = BinaryDataValue::from_bytes("large", ".bin", "application/octet-stream", vec![2; 100]);
        store
            .insert_binary_property(&built_in, &mut small, 10, 1, true)
            .await
            .unwrap();
        store
            .insert_binary_property(&built_in, &mut large, 10, 2, true)
            .await
            .unwrap();

        let small = store.load_binary_cache_entity(10, 1).await.unwrap().unwrap();
        let large = store.load_binary_cache_entity(10, 2).await.unwrap().unwrap();

        assert_eq!(small.stream, Some(vec![1; 99]));
        assert_eq!(large.size, 100);
        assert!(large.stream.is_none());
    }

    #[tokio::test]
    async fn test_delete_links_keeps_files() {
        let (store, built_in) = create_store().await;
        for (version_id, text) in [(10, "a"), (11, "b"), (12, "c")] {
            let mut value = text_value(text);
            store
                .insert_binary_property(&built_in, &mut value, version_id, 1, true)
                .await
                .unwrap();
        }

        store.delete_binary_property(10, 1).await.unwrap();
        let removed = store.delete_binary_properties(&[11, 12]).await.unwrap();

        assert_eq!(removed, 2);
        assert!(store.load_binary_property(10, 1).await.unwrap().is_none());
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Files")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(files, 3);
    }

    #[tokio::test]
    async fn test_fragment_reads() {
        let (store, built_in) = create_store().await;
        let mut value = text_value("0123456789");
        store
            .insert_binary_property(&built_in, &mut value, 10, 1, true)
            .await
            .unwrap();

        assert_eq!(store.load_binary_fragment(value.file_id, 3, 4).await.unwrap(), b"3456");
        assert_eq!(store.load_binary_fragment(value.file_id, 8, 10).await.unwrap(), b"89");
        assert!(store.load_binary_fragment(value.file_id, 20, 4).await.unwrap().is_empty());
        assert!(store.load_binary_fragment(9999, 0, 4).await.is_err());
    }
}
