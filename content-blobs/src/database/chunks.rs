//! Chunked upload protocol
//!
//! An upload starts by inserting a staging file row that carries the
//! version/property claim of its uploader. Chunks are written against that
//! row, and commit clears the claim and repoints the property link in one
//! transaction, so readers switch from the old content to the new one at once.

use super::models::{BinaryDataValue, ChunkToken, FileRecord};
use super::repository::MetadataStore;
use crate::error::{BlobStorageError, Result};
use crate::storage::builtin::BuiltInBlobProvider;
use crate::storage::provider::{BlobStorageContext, ProviderHandle};
use chrono::Utc;
use sqlx::SqliteConnection;

fn access_denied(file_id: i64, version_id: i64, property_type_id: i64) -> BlobStorageError {
    BlobStorageError::ChunkAccessDenied(format!(
        "file {} is not being uploaded for version {} property type {}",
        file_id, version_id, property_type_id
    ))
}

/// Write `buffer` at `offset` into the inline stream of a staging row.
///
/// The claim check and the write are one statement. A gap between the
/// current end of the stream and `offset` is filled with zeros. `substr` of
/// an empty blob is NULL in SQLite, so every slice is coalesced.
pub(crate) async fn write_staged_chunk(
    conn: &mut SqliteConnection,
    file_id: i64,
    version_id: i64,
    property_type_id: i64,
    offset: i64,
    buffer: &[u8],
) -> Result<()> {
    let rows = sqlx::query(
        r#"
        UPDATE Files
        SET Stream = CAST(
                COALESCE(substr(Stream, 1, ?1), x'')
                || zeroblob(MAX(?1 - COALESCE(length(Stream), 0), 0))
                || ?2
                || COALESCE(substr(Stream, ?1 + ?3 + 1), x'')
            AS BLOB),
            Timestamp = Timestamp + 1
        WHERE FileId = ?4 AND Staging = 1 AND BlobProvider IS NULL
          AND StagingVersionId = ?5 AND StagingPropertyTypeId = ?6
        "#,
    )
    .bind(offset)
    .bind(buffer)
    .bind(buffer.len() as i64)
    .bind(file_id)
    .bind(version_id)
    .bind(property_type_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(access_denied(file_id, version_id, property_type_id));
    }

    tracing::debug!(
        "Wrote {} bytes at offset {} into staging file {}",
        buffer.len(),
        offset,
        file_id
    );
    Ok(())
}

impl MetadataStore {
    /// Open a chunked upload for one property and return its token.
    pub async fn start_chunk(
        &self,
        provider: &ProviderHandle,
        version_id: i64,
        property_type_id: i64,
        full_size: i64,
    ) -> Result<ChunkToken> {
        if full_size < 0 {
            return Err(BlobStorageError::InvalidArgument(format!(
                "negative upload size {}",
                full_size
            )));
        }

        let mut ctx =
            BlobStorageContext::new(provider.clone(), version_id, property_type_id, 0, full_size);
        if provider.is_built_in() {
            BuiltInBlobProvider::check_length(full_size)?;
        } else {
            provider
                .provider()
                .allocate(&mut ctx)
                .await
                .map_err(|e| e.context(format!("Failed to allocate storage in {}", provider.name())))?;
        }

        match self.insert_staging_rows(&ctx, full_size).await {
            Ok(token) => {
                tracing::info!(
                    "Started chunked upload of {} bytes for version {} property type {} (file {}, provider {})",
                    full_size,
                    version_id,
                    property_type_id,
                    token.file_id,
                    provider.name()
                );
                Ok(token)
            }
            Err(e) => {
                self.discard_allocation(&ctx).await;
                Err(e.context("Failed to start chunked upload"))
            }
        }
    }

    async fn insert_staging_rows(&self, ctx: &BlobStorageContext, full_size: i64) -> Result<ChunkToken> {
        let provider_name = ctx.provider.stored_name();
        let provider_data = ctx.stored_provider_data()?;
        let initial_stream: Option<Vec<u8>> = ctx.provider.is_built_in().then(Vec::new);

        let mut tx = self.pool().begin().await?;

        // A re-upload keeps the names of the committed binary
        let (content_type, file_name, extension): (String, Option<String>, String) =
            sqlx::query_as(
                r#"
                SELECT F.ContentType, F.FileNameWithoutExtension, F.Extension
                FROM BinaryProperties B
                JOIN Files F ON F.FileId = B.FileId
                WHERE B.VersionId = ? AND B.PropertyTypeId = ? AND F.Staging = 0
                LIMIT 1
                "#,
            )
            .bind(ctx.version_id)
            .bind(ctx.property_type_id)
            .fetch_optional(&mut *tx)
            .await?
            .unwrap_or_default();

        let file_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO Files (ContentType, FileNameWithoutExtension, Extension, Size,
                               BlobProvider, BlobProviderData, Stream, CreationDate,
                               Staging, StagingVersionId, StagingPropertyTypeId)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            RETURNING FileId
            "#,
        )
        .bind(&content_type)
        .bind(&file_name)
        .bind(&extension)
        .bind(full_size)
        .bind(&provider_name)
        .bind(&provider_data)
        .bind(initial_stream)
        .bind(Utc::now())
        .bind(ctx.version_id)
        .bind(ctx.property_type_id)
        .fetch_one(&mut *tx)
        .await?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT BinaryPropertyId FROM BinaryProperties WHERE VersionId = ? AND PropertyTypeId = ? LIMIT 1",
        )
        .bind(ctx.version_id)
        .bind(ctx.property_type_id)
        .fetch_optional(&mut *tx)
        .await?;

        // The link is created against the staging row and stays invisible to
        // committed reads until commit repoints it.
        let binary_property_id = match existing {
            Some(id) => id,
            None => {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO BinaryProperties (VersionId, PropertyTypeId, FileId)
                    VALUES (?, ?, ?)
                    RETURNING BinaryPropertyId
                    "#,
                )
                .bind(ctx.version_id)
                .bind(ctx.property_type_id)
                .bind(file_id)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;

        Ok(ChunkToken {
            version_id: ctx.version_id,
            property_type_id: ctx.property_type_id,
            binary_property_id,
            file_id,
        })
    }

    /// Staging row targeted by a chunk write, if the claim matches
    pub async fn load_staging_file(
        &self,
        file_id: i64,
        version_id: i64,
        property_type_id: i64,
    ) -> Result<FileRecord> {
        sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT FileId, ContentType, FileNameWithoutExtension, Extension, Size, Checksum,
                   BlobProvider, BlobProviderData, CreationDate, Timestamp, IsDeleted,
                   Staging, StagingVersionId, StagingPropertyTypeId
            FROM Files
            WHERE FileId = ? AND Staging = 1
              AND StagingVersionId = ? AND StagingPropertyTypeId = ?
            "#,
        )
        .bind(file_id)
        .bind(version_id)
        .bind(property_type_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| access_denied(file_id, version_id, property_type_id))
    }

    /// Finalize an upload and make it the live content of the property.
    ///
    /// `source` supplies the content type, file name, extension and checksum
    /// to record; missing values keep what the staging row inherited.
    pub async fn commit_chunk(
        &self,
        version_id: i64,
        property_type_id: i64,
        file_id: i64,
        full_size: i64,
        source: Option<&BinaryDataValue>,
    ) -> Result<()> {
        self.commit_staging_row(version_id, property_type_id, file_id, full_size, source)
            .await
            .map_err(|e| e.context("Failed to commit chunked upload"))?;

        tracing::info!(
            "Committed chunked upload of {} bytes for version {} property type {} (file {})",
            full_size,
            version_id,
            property_type_id,
            file_id
        );
        Ok(())
    }

    async fn commit_staging_row(
        &self,
        version_id: i64,
        property_type_id: i64,
        file_id: i64,
        full_size: i64,
        source: Option<&BinaryDataValue>,
    ) -> Result<()> {
        let non_empty = |s: &String| (!s.is_empty()).then(|| s.clone());
        let content_type = source.and_then(|v| non_empty(&v.content_type));
        let file_name = source.and_then(|v| non_empty(&v.file_name));
        let extension = source.and_then(|v| non_empty(&v.extension));
        let checksum = source.and_then(|v| v.checksum.clone());

        let mut tx = self.pool().begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE Files
            SET Size = ?, Checksum = ?,
                ContentType = COALESCE(?, ContentType),
                FileNameWithoutExtension = COALESCE(?, FileNameWithoutExtension),
                Extension = COALESCE(?, Extension),
                Staging = 0, StagingVersionId = NULL, StagingPropertyTypeId = NULL,
                IsDeleted = 0, Timestamp = Timestamp + 1
            WHERE FileId = ? AND Staging = 1
              AND StagingVersionId = ? AND StagingPropertyTypeId = ?
            "#,
        )
        .bind(full_size)
        .bind(checksum)
        .bind(content_type)
        .bind(file_name)
        .bind(extension)
        .bind(file_id)
        .bind(version_id)
        .bind(property_type_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(access_denied(file_id, version_id, property_type_id));
        }

        let linked = sqlx::query(
            "UPDATE BinaryProperties SET FileId = ? WHERE VersionId = ? AND PropertyTypeId = ?",
        )
        .bind(file_id)
        .bind(version_id)
        .bind(property_type_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if linked == 0 {
            sqlx::query("INSERT INTO BinaryProperties (VersionId, PropertyTypeId, FileId) VALUES (?, ?, ?)")
                .bind(version_id)
                .bind(property_type_id)
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;
    use crate::storage::provider::BlobProvider;
    use std::sync::Arc;

    async fn create_store() -> (MetadataStore, ProviderHandle) {
        let pool = memory_pool().await;
        let store = MetadataStore::new(pool.clone(), 1_000_000);
        let built_in = BuiltInBlobProvider::new(pool, Arc::new(store.clone()), 64);
        (store, ProviderHandle::BuiltIn(Arc::new(built_in)))
    }

    fn staging_context(provider: &ProviderHandle, token: &ChunkToken, length: i64) -> BlobStorageContext {
        BlobStorageContext::new(provider.clone(), token.version_id, token.property_type_id, token.file_id, length)
    }

    #[tokio::test]
    async fn test_out_of_order_chunks() {
        let (store, built_in) = create_store().await;
        let token = store.start_chunk(&built_in, 7, 3, 200).await.unwrap();
        let ctx = staging_context(&built_in, &token, 200);

        built_in.provider().write(&ctx, 100, &[2u8; 100]).await.unwrap();
        built_in.provider().write(&ctx, 0, &[1u8; 100]).await.unwrap();
        store.commit_chunk(7, 3, token.file_id, 200, None).await.unwrap();

        let bytes = store.load_binary_fragment(token.file_id, 0, 1000).await.unwrap();
        let mut expected = vec![1u8; 100];
        expected.extend_from_slice(&[2u8; 100]);
        assert_eq!(bytes, expected);
    }

    #[tokio::test]
    async fn test_gap_reads_as_zeros() {
        let (store, built_in) = create_store().await;
        let token = store.start_chunk(&built_in, 7, 3, 10).await.unwrap();
        let ctx = staging_context(&built_in, &token, 10);

        built_in.provider().write(&ctx, 6, &[9u8; 4]).await.unwrap();

        let bytes = store.load_binary_fragment(token.file_id, 0, 100).await.unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn test_staging_row_invisible_until_commit() {
        let (store, built_in) = create_store().await;
        let token = store.start_chunk(&built_in, 7, 3, 4).await.unwrap();
        let ctx = staging_context(&built_in, &token, 4);
        built_in.provider().write(&ctx, 0, b"data").await.unwrap();

        assert!(store.load_binary_property(7, 3).await.unwrap().is_none());
        assert!(store.load_binary_cache_entity(7, 3).await.unwrap().is_none());

        store.commit_chunk(7, 3, token.file_id, 4, None).await.unwrap();

        let loaded = store.load_binary_property(7, 3).await.unwrap().unwrap();
        assert_eq!(loaded.file_id, token.file_id);
        assert_eq!(loaded.id, token.binary_property_id);
        assert_eq!(loaded.size, 4);
    }

    #[tokio::test]
    async fn test_foreign_claim_rejected() {
        let (store, built_in) = create_store().await;
        let token = store.start_chunk(&built_in, 7, 3, 4).await.unwrap();
        let ctx = staging_context(&built_in, &token, 4);
        built_in.provider().write(&ctx, 0, b"mine").await.unwrap();

        let forged = BlobStorageContext::new(built_in.clone(), 8, 3, token.file_id, 4);
        let err = built_in.provider().write(&forged, 0, b"evil").await.unwrap_err();
        assert!(err.is_access_denied());

        let err = store.commit_chunk(8, 3, token.file_id, 4, None).await.unwrap_err();
        assert!(err.is_access_denied());
        assert!(store.load_staging_file(token.file_id, 7, 4).await.unwrap_err().is_access_denied());

        let bytes = store.load_binary_fragment(token.file_id, 0, 100).await.unwrap();
        assert_eq!(bytes, b"mine");
    }

    #[tokio::test]
    async fn test_reupload_keeps_names_and_previous_content() {
        let (store, built_in) = create_store().await;
        let mut value = BinaryDataValue::from_bytes("report", ".pdf", "application/pdf", b"v1".to_vec());
        store
            .insert_binary_property(&built_in, &mut value, 7, 3, true)
            .await
            .unwrap();

        let token = store.start_chunk(&built_in, 7, 3, 2).await.unwrap();
        assert_eq!(token.binary_property_id, value.id);

        let staging = store.load_staging_file(token.file_id, 7, 3).await.unwrap();
        assert_eq!(staging.content_type, "application/pdf");
        assert_eq!(staging.file_name_without_extension.as_deref(), Some("report"));

        // Previous content stays readable while the upload is open
        let ctx = staging_context(&built_in, &token, 2);
        built_in.provider().write(&ctx, 0, b"v2").await.unwrap();
        let live = store.load_binary_property(7, 3).await.unwrap().unwrap();
        assert_eq!(live.file_id, value.file_id);

        store.commit_chunk(7, 3, token.file_id, 2, None).await.unwrap();
        let live = store.load_binary_property(7, 3).await.unwrap().unwrap();
        assert_eq!(live.file_id, token.file_id);
        assert_eq!(live.extension, ".pdf");
    }

    #[tokio::test]
    async fn test_commit_records_source_metadata() {
        let (store, built_in) = create_store().await;
        let token = store.start_chunk(&built_in, 7, 3, 3).await.unwrap();
        let ctx = staging_context(&built_in, &token, 3);
        built_in.provider().write(&ctx, 0, b"abc").await.unwrap();

        let source = BinaryDataValue {
            content_type: "text/plain".to_string(),
            file_name: "letters".to_string(),
            extension: ".txt".to_string(),
            checksum: Some("cafe".to_string()),
            ..BinaryDataValue::default()
        };
        store
            .commit_chunk(7, 3, token.file_id, 3, Some(&source))
            .await
            .unwrap();

        let record = store.load_file_record(token.file_id).await.unwrap().unwrap();
        assert!(!record.staging);
        assert!(record.staging_version_id.is_none());
        assert_eq!(record.content_type, "text/plain");
        assert_eq!(record.checksum.as_deref(), Some("cafe"));

        // A committed row no longer accepts chunks
        let err = built_in.provider().write(&ctx, 0, b"xyz").await.unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn test_oversized_built_in_upload_rejected() {
        let (store, built_in) = create_store().await;

        let err = store
            .start_chunk(&built_in, 7, 3, i32::MAX as i64 + 1)
            .await
            .unwrap_err();
        assert!(err.is_not_supported());
    }

    #[tokio::test]
    async fn test_binary_bytes_survive_chunked_writes() {
        let (store, built_in) = create_store().await;
        let data: Vec<u8> = (0..=255u8).rev().chain(0..=255u8).collect();
        let token = store.start_chunk(&built_in, 7, 3, data.len() as i64).await.unwrap();
        let ctx = staging_context(&built_in, &token, data.len() as i64);

        built_in.provider().write(&ctx, 256, &data[256..]).await.unwrap();
        built_in.provider().write(&ctx, 0, &data[..256]).await.unwrap();
        store
            .commit_chunk(7, 3, token.file_id, data.len() as i64, None)
            .await
            .unwrap();

        let bytes = store.load_binary_fragment(token.file_id, 0, 1000).await.unwrap();
        assert_eq!(bytes, data);
        assert_eq!(bytes[255], 0x00);
        assert_eq!(bytes[0], 0xff);
    }

    #[tokio::test]
    async fn test_overlapping_rewrites_keep_last_write() {
        let (store, built_in) = create_store().await;
        let token = store.start_chunk(&built_in, 7, 3, 8).await.unwrap();
        let ctx = staging_context(&built_in, &token, 8);

        built_in.provider().write(&ctx, 0, &[0xaa; 8]).await.unwrap();
        built_in.provider().write(&ctx, 2, &[0x00, 0x80, 0x00]).await.unwrap();
        built_in.provider().write(&ctx, 4, &[0xff; 2]).await.unwrap();
        built_in.provider().write(&ctx, 2, &[0x00, 0x80, 0x00]).await.unwrap();

        let bytes = store.load_binary_fragment(token.file_id, 0, 100).await.unwrap();
        assert_eq!(bytes, vec![0xaa, 0xaa, 0x00, 0x80, 0x00, 0xff, 0xaa, 0xaa]);
    }

    #[tokio::test]
    async fn test_overflowing_offset_rejected() {
        let (store, built_in) = create_store().await;
        let token = store.start_chunk(&built_in, 7, 3, 8).await.unwrap();
        let ctx = staging_context(&built_in, &token, 8);

        let err = built_in.provider().write(&ctx, i64::MAX, b"ab").await.unwrap_err();
        assert!(matches!(err, BlobStorageError::InvalidArgument(_)));

        let err = built_in
            .provider()
            .write(&ctx, i32::MAX as i64, b"ab")
            .await
            .unwrap_err();
        assert!(err.is_not_supported());
    }
}
