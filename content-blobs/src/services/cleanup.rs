//! File cleanup service
//!
//! Reclaims file rows no binary property links to. A sweep flags orphans,
//! then a drain deletes the flagged rows one at a time and asks the owning
//! provider to free their bytes.

use crate::config::BlobStorageConfig;
use crate::database::{DeletedFileRow, MetadataStore};
use crate::error::{BlobStorageError, Result};
use crate::storage::selector::BlobProviderSelector;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Which unreferenced rows a sweep flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteFlagPolicy {
    /// Only rows older than the cleanup grace period
    GracePeriod,
    /// Every committed orphan, regardless of age
    Immediate,
}

#[derive(Debug, Clone, Default)]
pub struct DrainOptions {
    /// Skip rows that fail instead of aborting the drain
    pub continue_on_error: bool,
    /// Pause between rows; falls back to the configured delay
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub deleted: u64,
    pub failed: Vec<i64>,
}

enum DrainStep {
    Deleted,
    Failed(i64, BlobStorageError),
    Empty,
}

pub struct FileCleanupService {
    store: MetadataStore,
    selector: Arc<BlobProviderSelector>,
    grace_period: Duration,
    staging_grace_period: Duration,
    delay: Option<Duration>,
    delete_timeout: Duration,
}

fn cutoff(age: Duration) -> chrono::DateTime<Utc> {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
}

impl FileCleanupService {
    pub fn new(store: MetadataStore, selector: Arc<BlobProviderSelector>, config: &BlobStorageConfig) -> Self {
        Self {
            store,
            selector,
            grace_period: config.cleanup_grace_period(),
            staging_grace_period: config.staging_grace_period(),
            delay: config.cleanup_delay(),
            delete_timeout: config.provider_delete_timeout(),
        }
    }

    /// Bound on one provider delete; the drain holds a write transaction
    /// for its duration.
    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Flag orphaned rows for the next drain. Returns the number flagged.
    pub async fn set_delete_flag(&self, policy: DeleteFlagPolicy) -> Result<u64> {
        let orphan_cutoff = match policy {
            DeleteFlagPolicy::GracePeriod => Some(cutoff(self.grace_period)),
            DeleteFlagPolicy::Immediate => None,
        };

        let flagged = self
            .store
            .set_delete_flag(orphan_cutoff, cutoff(self.staging_grace_period))
            .await?;

        tracing::info!("Flagged {} orphaned file(s) for deletion ({:?})", flagged, policy);
        Ok(flagged)
    }

    pub async fn set_delete_flag_immediately(&self) -> Result<u64> {
        self.set_delete_flag(DeleteFlagPolicy::Immediate).await
    }

    /// Delete one flagged row. Returns whether a row was removed.
    pub async fn cleanup_files(&self) -> Result<bool> {
        match self.drain_step(&[]).await? {
            DrainStep::Deleted => Ok(true),
            DrainStep::Empty => Ok(false),
            DrainStep::Failed(file_id, e) => {
                Err(e.context(format!("Failed to clean up file {}", file_id)))
            }
        }
    }

    /// Drain every flagged row
    pub async fn cleanup_all_files(
        &self,
        options: &DrainOptions,
        cancel: &CancellationToken,
    ) -> Result<DrainReport> {
        let delay = options.delay.or(self.delay);
        let mut report = DrainReport::default();

        loop {
            if cancel.is_cancelled() {
                tracing::info!("Cleanup cancelled after {} file(s)", report.deleted);
                return Err(BlobStorageError::Cancelled);
            }

            match self.drain_step(&report.failed).await? {
                DrainStep::Empty => break,
                DrainStep::Deleted => report.deleted += 1,
                DrainStep::Failed(file_id, e) if options.continue_on_error => {
                    tracing::error!("Skipping file {} for this cleanup: {}", file_id, e);
                    report.failed.push(file_id);
                }
                DrainStep::Failed(file_id, e) => {
                    return Err(e.context(format!("Failed to clean up file {}", file_id)));
                }
            }

            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if report.deleted > 0 {
            if let Err(e) = self.store.reclaim_space().await {
                tracing::warn!("Failed to reclaim space after cleanup: {}", e);
            }
        }

        tracing::info!(
            "Cleanup finished: {} file(s) deleted, {} failed",
            report.deleted,
            report.failed.len()
        );
        Ok(report)
    }

    /// Reclaim everything a replaced binary left behind
    pub async fn delete_orphaned_files(&self) -> Result<DrainReport> {
        self.set_delete_flag(DeleteFlagPolicy::Immediate).await?;
        self.cleanup_all_files(&DrainOptions::default(), &CancellationToken::new())
            .await
    }

    /// One scheduled pass: grace-period sweep then a tolerant drain
    pub async fn run_maintenance(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        self.set_delete_flag(DeleteFlagPolicy::GracePeriod).await?;
        let options = DrainOptions {
            continue_on_error: true,
            delay: None,
        };
        self.cleanup_all_files(&options, cancel).await
    }

    async fn drain_step(&self, skip: &[i64]) -> Result<DrainStep> {
        let Some(pending) = self.store.begin_file_deletion(skip).await? else {
            return Ok(DrainStep::Empty);
        };
        let file_id = pending.file.file_id;

        match self.delete_blob(&pending.file).await {
            Ok(()) => {
                pending.commit().await?;
                tracing::debug!("Deleted file {}", file_id);
                Ok(DrainStep::Deleted)
            }
            Err(e) => {
                pending.rollback().await?;
                Ok(DrainStep::Failed(file_id, e))
            }
        }
    }

    async fn delete_blob(&self, file: &DeletedFileRow) -> Result<()> {
        let ctx = self.selector.create_context(
            file.file_id,
            file.size,
            file.blob_provider.as_deref(),
            file.blob_provider_data.as_deref(),
        )?;
        tokio::time::timeout(self.delete_timeout, ctx.provider.provider().delete(&ctx))
            .await
            .map_err(|_| {
                BlobStorageError::Timeout(format!(
                    "{} did not delete file {} within {:?}",
                    ctx.provider.name(),
                    file.file_id,
                    self.delete_timeout
                ))
            })?
    }
}
