/// Cleanup Scheduler
/// Runs the orphaned file cleanup on a schedule using cron expressions
use crate::error::{BlobStorageError, Result};
use crate::services::cleanup::FileCleanupService;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cleanup frequency options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupFrequency {
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl CleanupFrequency {
    /// Convert frequency to cron expression
    fn to_cron(self) -> String {
        match self {
            CleanupFrequency::Minutes(1) => "0 * * * * *".to_string(),
            CleanupFrequency::Minutes(m) => format!("0 */{} * * * *", m),
            CleanupFrequency::Hours(1) => "0 0 * * * *".to_string(),
            CleanupFrequency::Hours(h) => format!("0 0 */{} * * *", h),
            CleanupFrequency::Days(1) => "0 0 3 * * *".to_string(), // Daily at 3 AM
            CleanupFrequency::Days(d) => format!("0 0 3 */{} * *", d),
        }
    }
}

impl FromStr for CleanupFrequency {
    type Err = BlobStorageError;

    /// Formats: "30m", "2h", "1d"
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let invalid = |reason: &str| {
            BlobStorageError::Configuration(format!("Invalid cleanup interval '{}': {}", s, reason))
        };

        let Some(unit) = s.chars().last() else {
            return Err(invalid("empty"));
        };
        let value: u32 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid("expected <number><unit>"))?;

        if value == 0 {
            return Err(invalid("must be greater than 0"));
        }

        // Cron steps restart every hour, day and month
        match unit {
            'm' if value > 59 => Err(invalid("minute intervals must be below 60, use hours")),
            'h' if value > 23 => Err(invalid("hour intervals must be below 24, use days")),
            'd' if value > 31 => Err(invalid("day intervals must not exceed 31")),
            'm' => Ok(CleanupFrequency::Minutes(value)),
            'h' => Ok(CleanupFrequency::Hours(value)),
            'd' => Ok(CleanupFrequency::Days(value)),
            _ => Err(invalid("use 'm' (minutes), 'h' (hours), or 'd' (days)")),
        }
    }
}

/// Scheduler for the recurring cleanup
pub struct CleanupScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    cleanup: Arc<FileCleanupService>,
    current_job_id: Arc<RwLock<Option<Uuid>>>,
    cancel: CancellationToken,
}

impl CleanupScheduler {
    pub async fn new(cleanup: Arc<FileCleanupService>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| BlobStorageError::Scheduler(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            cleanup,
            current_job_id: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
        })
    }

    /// Start the scheduler
    pub async fn start(&self) -> Result<()> {
        let scheduler = self.scheduler.read().await;
        scheduler
            .start()
            .await
            .map_err(|e| BlobStorageError::Scheduler(format!("Failed to start scheduler: {}", e)))?;
        tracing::info!("Cleanup scheduler started");
        Ok(())
    }

    /// Schedule the cleanup, replacing any previous schedule
    pub async fn schedule_cleanup(&self, frequency: CleanupFrequency) -> Result<()> {
        self.cancel_cleanup().await?;

        let cron_expr = frequency.to_cron();
        let cleanup = Arc::clone(&self.cleanup);
        let cancel = self.cancel.clone();

        let job = Job::new_async(cron_expr.clone(), move |_uuid, _l| {
            let cleanup = Arc::clone(&cleanup);
            let cancel = cancel.clone();
            Box::pin(async move {
                tracing::info!("Running scheduled file cleanup");

                match cleanup.run_maintenance(&cancel).await {
                    Ok(report) if report.failed.is_empty() => {
                        tracing::info!("Scheduled cleanup deleted {} file(s)", report.deleted);
                    }
                    Ok(report) => {
                        tracing::warn!(
                            "Scheduled cleanup deleted {} file(s), failed on {:?}",
                            report.deleted,
                            report.failed
                        );
                    }
                    Err(BlobStorageError::Cancelled) => {
                        tracing::info!("Scheduled cleanup cancelled");
                    }
                    Err(e) => {
                        tracing::error!("Scheduled cleanup failed: {}", e);
                    }
                }
            })
        })
        .map_err(|e| BlobStorageError::Scheduler(format!("Failed to create cleanup job: {}", e)))?;

        let job_id = job.guid();

        let scheduler = self.scheduler.write().await;
        scheduler
            .add(job)
            .await
            .map_err(|e| BlobStorageError::Scheduler(format!("Failed to schedule job: {}", e)))?;

        let mut current_job = self.current_job_id.write().await;
        *current_job = Some(job_id);

        tracing::info!("File cleanup scheduled: {:?} ({})", frequency, cron_expr);
        Ok(())
    }

    /// Cancel the scheduled cleanup
    pub async fn cancel_cleanup(&self) -> Result<()> {
        let mut current_job = self.current_job_id.write().await;

        if let Some(job_id) = *current_job {
            let scheduler = self.scheduler.write().await;
            scheduler
                .remove(&job_id)
                .await
                .map_err(|e| BlobStorageError::Scheduler(format!("Failed to remove job: {}", e)))?;

            *current_job = None;
            tracing::info!("File cleanup schedule cancelled");
        }

        Ok(())
    }

    /// Stop a running drain between rows and shut the scheduler down
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();

        let mut scheduler = self.scheduler.write().await;
        scheduler
            .shutdown()
            .await
            .map_err(|e| BlobStorageError::Scheduler(format!("Failed to shutdown scheduler: {}", e)))?;
        tracing::info!("Cleanup scheduler shutdown");
        Ok(())
    }
}
