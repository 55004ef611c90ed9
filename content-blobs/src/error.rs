//! Error types for the blob subsystem
//!
//! All errors use thiserror for structured error handling.
//! Transport failures (database, IO) are wrapped with the name of the
//! operation that failed; contract and security violations are surfaced as-is.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobStorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Chunk access denied: {0}")]
    ChunkAccessDenied(String),

    #[error("Invalid chunk token: {0}")]
    InvalidChunkToken(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Blob provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{context}: {source}")]
    Storage {
        context: String,
        source: Box<BlobStorageError>,
    },
}

impl BlobStorageError {
    /// Wrap database and IO failures with the failing operation's name.
    ///
    /// Every other kind passes through unchanged so callers can still match
    /// on access-denied or not-supported errors.
    pub fn context(self, context: impl Into<String>) -> Self {
        match self {
            err @ (BlobStorageError::Database(_) | BlobStorageError::Io(_)) => {
                BlobStorageError::Storage {
                    context: context.into(),
                    source: Box::new(err),
                }
            }
            other => other,
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, BlobStorageError::ChunkAccessDenied(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, BlobStorageError::NotSupported(_))
    }
}

pub type Result<T> = std::result::Result<T, BlobStorageError>;
