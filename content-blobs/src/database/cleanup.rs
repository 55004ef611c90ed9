//! Orphaned file reclamation
//!
//! Phase one flags unreferenced rows in a single statement. Phase two removes
//! one flagged row per transaction; the transaction stays open while the
//! owning provider frees the bytes, so a failed provider delete leaves the
//! row in place for the next drain.

use super::models::DeletedFileRow;
use super::repository::MetadataStore;
use crate::error::{BlobStorageError, Result};
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

/// A deleted row whose removal is not committed yet
pub struct PendingFileDeletion {
    tx: Transaction<'static, Sqlite>,
    pub file: DeletedFileRow,
}

impl PendingFileDeletion {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Restore the row, keeping its delete flag
    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl MetadataStore {
    /// Flag unreferenced rows for deletion.
    ///
    /// Committed rows are flagged once they are unreferenced and older than
    /// `orphan_cutoff`, or regardless of age when it is `None`. Staging rows
    /// are flagged only after `staging_cutoff`, so open uploads survive an
    /// immediate sweep. An abandoned first upload is flagged even though its
    /// property link points at it.
    pub async fn set_delete_flag(
        &self,
        orphan_cutoff: Option<DateTime<Utc>>,
        staging_cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let flagged = sqlx::query(
            r#"
            UPDATE Files SET IsDeleted = 1
            WHERE IsDeleted = 0
              AND ((Staging = 0 AND (?1 IS NULL OR CreationDate < ?1)
                    AND NOT EXISTS (SELECT 1 FROM BinaryProperties B WHERE B.FileId = Files.FileId))
                   OR (Staging = 1 AND CreationDate < ?2))
            "#,
        )
        .bind(orphan_cutoff)
        .bind(staging_cutoff)
        .execute(self.pool())
        .await
        .map_err(|e| BlobStorageError::from(e).context("Failed to flag orphaned files"))?
        .rows_affected();

        Ok(flagged)
    }

    /// Delete the next flagged row inside a transaction the caller finishes.
    ///
    /// Committed rows linked again since they were flagged get their flag
    /// cleared first. A flagged staging row takes the property link of its
    /// abandoned first upload with it. Rows in `skip` are left alone. Returns
    /// `None` once nothing flagged remains.
    pub async fn begin_file_deletion(&self, skip: &[i64]) -> Result<Option<PendingFileDeletion>> {
        let mut tx = self.pool().begin().await?;

        let relinked = sqlx::query(
            r#"
            UPDATE Files SET IsDeleted = 0
            WHERE IsDeleted = 1 AND Staging = 0
              AND EXISTS (SELECT 1 FROM BinaryProperties B WHERE B.FileId = Files.FileId)
            "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if relinked > 0 {
            tracing::warn!("Cleared the delete flag of {} relinked file(s)", relinked);
        }

        let mut query = String::from(
            r#"
            SELECT FileId FROM Files
            WHERE IsDeleted = 1
              AND (Staging = 1
                   OR NOT EXISTS (SELECT 1 FROM BinaryProperties B WHERE B.FileId = Files.FileId))
            "#,
        );
        if !skip.is_empty() {
            let placeholders = vec!["?"; skip.len()].join(", ");
            query.push_str(&format!("  AND FileId NOT IN ({})\n", placeholders));
        }
        query.push_str("ORDER BY FileId LIMIT 1");

        let mut q = sqlx::query_scalar::<_, i64>(&query);
        for file_id in skip {
            q = q.bind(file_id);
        }

        let Some(file_id) = q.fetch_optional(&mut *tx).await? else {
            tx.commit().await?;
            return Ok(None);
        };

        // Only a staging row can still be linked here
        let unlinked = sqlx::query("DELETE FROM BinaryProperties WHERE FileId = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if unlinked > 0 {
            tracing::info!("Dropped the link of abandoned upload file {}", file_id);
        }

        let file = sqlx::query_as::<_, DeletedFileRow>(
            r#"
            DELETE FROM Files WHERE FileId = ?
            RETURNING FileId, Size, BlobProvider, BlobProviderData
            "#,
        )
        .bind(file_id)
        .fetch_one(&mut *tx)
        .await?;

        Ok(Some(PendingFileDeletion { tx, file }))
    }

    /// Return pages freed by deleted inline streams to the filesystem
    pub async fn reclaim_space(&self) -> Result<()> {
        sqlx::query("PRAGMA incremental_vacuum").execute(self.pool()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;
    use chrono::Duration;

    async fn insert_file(store: &MetadataStore, created: DateTime<Utc>, staging: bool) -> i64 {
        sqlx::query_scalar(
            "INSERT INTO Files (Stream, CreationDate, Staging) VALUES (x'00', ?, ?) RETURNING FileId",
        )
        .bind(created)
        .bind(staging)
        .fetch_one(store.pool())
        .await
        .unwrap()
    }

    async fn link(store: &MetadataStore, version_id: i64, file_id: i64) {
        sqlx::query("INSERT INTO BinaryProperties (VersionId, PropertyTypeId, FileId) VALUES (?, 1, ?)")
            .bind(version_id)
            .bind(file_id)
            .execute(store.pool())
            .await
            .unwrap();
    }

    async fn is_flagged(store: &MetadataStore, file_id: i64) -> bool {
        sqlx::query_scalar("SELECT IsDeleted FROM Files WHERE FileId = ?")
            .bind(file_id)
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_grace_period_protects_young_orphans() {
        let store = MetadataStore::new(memory_pool().await, 1000);
        let now = Utc::now();
        let young = insert_file(&store, now, false).await;
        let old = insert_file(&store, now - Duration::hours(2), false).await;
        let linked = insert_file(&store, now - Duration::hours(2), false).await;
        link(&store, 1, linked).await;

        let flagged = store
            .set_delete_flag(Some(now - Duration::minutes(30)), now - Duration::days(1))
            .await
            .unwrap();

        assert_eq!(flagged, 1);
        assert!(!is_flagged(&store, young).await);
        assert!(is_flagged(&store, old).await);
        assert!(!is_flagged(&store, linked).await);
    }

    #[tokio::test]
    async fn test_immediate_policy_spares_open_uploads() {
        let store = MetadataStore::new(memory_pool().await, 1000);
        let now = Utc::now();
        let orphan = insert_file(&store, now, false).await;
        let upload = insert_file(&store, now, true).await;
        let abandoned = insert_file(&store, now - Duration::days(2), true).await;

        store
            .set_delete_flag(None, now - Duration::days(1))
            .await
            .unwrap();

        assert!(is_flagged(&store, orphan).await);
        assert!(!is_flagged(&store, upload).await);
        assert!(is_flagged(&store, abandoned).await);
    }

    #[tokio::test]
    async fn test_drain_removes_one_row_per_call() {
        let store = MetadataStore::new(memory_pool().await, 1000);
        let now = Utc::now();
        let first = insert_file(&store, now, false).await;
        let second = insert_file(&store, now, false).await;
        store.set_delete_flag(None, now).await.unwrap();

        let pending = store.begin_file_deletion(&[]).await.unwrap().unwrap();
        assert_eq!(pending.file.file_id, first);
        pending.commit().await.unwrap();

        let pending = store.begin_file_deletion(&[]).await.unwrap().unwrap();
        assert_eq!(pending.file.file_id, second);
        pending.commit().await.unwrap();

        assert!(store.begin_file_deletion(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_keeps_flagged_row() {
        let store = MetadataStore::new(memory_pool().await, 1000);
        let now = Utc::now();
        let file_id = insert_file(&store, now, false).await;
        store.set_delete_flag(None, now).await.unwrap();

        let pending = store.begin_file_deletion(&[]).await.unwrap().unwrap();
        pending.rollback().await.unwrap();

        assert!(is_flagged(&store, file_id).await);
        assert!(store.begin_file_deletion(&[file_id]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_relinked_row_survives_drain() {
        let store = MetadataStore::new(memory_pool().await, 1000);
        let now = Utc::now();
        let file_id = insert_file(&store, now, false).await;
        store.set_delete_flag(None, now).await.unwrap();
        link(&store, 5, file_id).await;

        assert!(store.begin_file_deletion(&[]).await.unwrap().is_none());
        assert!(!is_flagged(&store, file_id).await);
    }

    #[tokio::test]
    async fn test_abandoned_first_upload_is_reclaimed() {
        let store = MetadataStore::new(memory_pool().await, 1000);
        let now = Utc::now();
        let abandoned = insert_file(&store, now - Duration::days(2), true).await;
        link(&store, 9, abandoned).await;
        let open = insert_file(&store, now, true).await;
        link(&store, 10, open).await;

        let flagged = store
            .set_delete_flag(None, now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(flagged, 1);
        assert!(is_flagged(&store, abandoned).await);

        let pending = store.begin_file_deletion(&[]).await.unwrap().unwrap();
        assert_eq!(pending.file.file_id, abandoned);
        pending.commit().await.unwrap();

        let links: Vec<i64> = sqlx::query_scalar("SELECT VersionId FROM BinaryProperties")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(links, vec![10]);
        assert!(store.begin_file_deletion(&[]).await.unwrap().is_none());
        assert!(!is_flagged(&store, open).await);
    }

    #[tokio::test]
    async fn test_rolled_back_upload_deletion_keeps_link() {
        let store = MetadataStore::new(memory_pool().await, 1000);
        let now = Utc::now();
        let abandoned = insert_file(&store, now - Duration::days(2), true).await;
        link(&store, 9, abandoned).await;
        store.set_delete_flag(None, now - Duration::days(1)).await.unwrap();

        let pending = store.begin_file_deletion(&[]).await.unwrap().unwrap();
        pending.rollback().await.unwrap();

        let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM BinaryProperties WHERE FileId = ?")
            .bind(abandoned)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(links, 1);
        assert!(is_flagged(&store, abandoned).await);
    }
}
