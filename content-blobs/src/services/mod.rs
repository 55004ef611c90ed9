//! Services module
//!
//! Coordinate the metadata store, the providers and background work.

pub mod blob_storage;
pub mod cleanup;
pub mod scheduler;

pub use blob_storage::{BinaryCacheEntity, BlobStorage};
pub use cleanup::{DeleteFlagPolicy, DrainOptions, DrainReport, FileCleanupService};
pub use scheduler::{CleanupFrequency, CleanupScheduler};
