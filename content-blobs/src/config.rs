//! Blob storage configuration
//!
//! Central location for the routing, caching and cleanup limits of the blob
//! subsystem. Values come from an optional JSON file, then `BLOBS_CONF_*`
//! environment variables override them.

use crate::error::{BlobStorageError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ===== Routing =====

/// Payloads smaller than this stay inline in the metadata database.
pub const DEFAULT_MINIMUM_SIZE_FOR_BLOB_PROVIDER: i64 = 500_000;

// ===== Caching and streaming =====

/// Binaries smaller than this are returned inline with their metadata.
pub const DEFAULT_BINARY_CACHE_SIZE: i64 = 1_000_000;

/// Size of one range read issued by the read stream adapter.
pub const DEFAULT_BINARY_BUFFER_SIZE: usize = 1024 * 1024;

/// The built-in provider writes through a 32-bit length primitive.
pub const MAX_BUILT_IN_STREAM_LENGTH: i64 = i32::MAX as i64;

// ===== Cleanup =====

/// Age before an unreferenced committed file is flagged for deletion.
pub const DEFAULT_CLEANUP_GRACE_PERIOD_MINUTES: u64 = 30;

/// Age before an abandoned chunked upload is flagged for deletion (1 day).
pub const DEFAULT_STAGING_GRACE_PERIOD_MINUTES: u64 = 24 * 60;

pub const DEFAULT_CLEANUP_INTERVAL: &str = "30m";

/// Longest a provider delete may hold the drain's write transaction.
pub const DEFAULT_PROVIDER_DELETE_TIMEOUT_SECONDS: u64 = 30;

/// Blob storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_minimum_size_for_blob_provider")]
    pub minimum_size_for_blob_provider_in_bytes: i64,
    #[serde(default = "default_binary_cache_size")]
    pub binary_cache_size: i64,
    #[serde(default = "default_binary_buffer_size")]
    pub binary_buffer_size: usize,
    /// Provider used for payloads at or above the routing threshold.
    #[serde(default)]
    pub external_provider: Option<String>,
    /// Enables the filesystem provider rooted at this directory.
    #[serde(default)]
    pub local_provider_root: Option<PathBuf>,
    #[serde(default = "default_cleanup_grace_period")]
    pub cleanup_grace_period_minutes: u64,
    #[serde(default = "default_staging_grace_period")]
    pub staging_grace_period_minutes: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,
    #[serde(default = "default_provider_delete_timeout")]
    pub provider_delete_timeout_seconds: u64,
    /// Pause between drain iterations. Only meant for tests.
    #[serde(default)]
    pub cleanup_delay_ms: Option<u64>,
    /// Key material for sealing chunk tokens. A random secret is generated
    /// at startup when absent, which invalidates tokens across restarts.
    #[serde(default)]
    pub chunk_token_secret: Option<String>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/content-blobs.db")
}

fn default_minimum_size_for_blob_provider() -> i64 {
    DEFAULT_MINIMUM_SIZE_FOR_BLOB_PROVIDER
}

fn default_binary_cache_size() -> i64 {
    DEFAULT_BINARY_CACHE_SIZE
}

fn default_binary_buffer_size() -> usize {
    DEFAULT_BINARY_BUFFER_SIZE
}

fn default_cleanup_grace_period() -> u64 {
    DEFAULT_CLEANUP_GRACE_PERIOD_MINUTES
}

fn default_staging_grace_period() -> u64 {
    DEFAULT_STAGING_GRACE_PERIOD_MINUTES
}

fn default_cleanup_interval() -> String {
    DEFAULT_CLEANUP_INTERVAL.to_string()
}

fn default_provider_delete_timeout() -> u64 {
    DEFAULT_PROVIDER_DELETE_TIMEOUT_SECONDS
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            minimum_size_for_blob_provider_in_bytes: default_minimum_size_for_blob_provider(),
            binary_cache_size: default_binary_cache_size(),
            binary_buffer_size: default_binary_buffer_size(),
            external_provider: None,
            local_provider_root: None,
            cleanup_grace_period_minutes: default_cleanup_grace_period(),
            staging_grace_period_minutes: default_staging_grace_period(),
            cleanup_interval: default_cleanup_interval(),
            provider_delete_timeout_seconds: default_provider_delete_timeout(),
            cleanup_delay_ms: None,
            chunk_token_secret: None,
        }
    }
}

impl BlobStorageConfig {
    /// Load configuration from an optional JSON file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                let config: BlobStorageConfig = serde_json::from_str(&content)?;
                tracing::info!("Loaded blob storage configuration from {:?}", path);
                config
            }
            Some(path) => {
                tracing::warn!("Configuration file {:?} not found, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    /// Format: BLOBS_CONF_<KEY>
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("BLOBS_CONF_DATABASE_PATH") {
            self.database_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("BLOBS_CONF_MINIMUM_SIZE_FOR_BLOB_PROVIDER") {
            if let Ok(size) = val.parse() {
                self.minimum_size_for_blob_provider_in_bytes = size;
            }
        }
        if let Ok(val) = env::var("BLOBS_CONF_BINARY_CACHE_SIZE") {
            if let Ok(size) = val.parse() {
                self.binary_cache_size = size;
            }
        }
        if let Ok(val) = env::var("BLOBS_CONF_BINARY_BUFFER_SIZE") {
            if let Ok(size) = val.parse() {
                self.binary_buffer_size = size;
            }
        }
        if let Ok(val) = env::var("BLOBS_CONF_EXTERNAL_PROVIDER") {
            self.external_provider = Some(val).filter(|v| !v.trim().is_empty());
        }
        if let Ok(val) = env::var("BLOBS_CONF_LOCAL_PROVIDER_ROOT") {
            if !val.trim().is_empty() {
                self.local_provider_root = Some(PathBuf::from(val));
            }
        }
        if let Ok(val) = env::var("BLOBS_CONF_CLEANUP_GRACE_PERIOD_MINUTES") {
            if let Ok(minutes) = val.parse() {
                self.cleanup_grace_period_minutes = minutes;
            }
        }
        if let Ok(val) = env::var("BLOBS_CONF_STAGING_GRACE_PERIOD_MINUTES") {
            if let Ok(minutes) = val.parse() {
                self.staging_grace_period_minutes = minutes;
            }
        }
        if let Ok(val) = env::var("BLOBS_CONF_CLEANUP_INTERVAL") {
            self.cleanup_interval = val;
        }
        if let Ok(val) = env::var("BLOBS_CONF_PROVIDER_DELETE_TIMEOUT_SECONDS") {
            if let Ok(seconds) = val.parse() {
                self.provider_delete_timeout_seconds = seconds;
            }
        }
        if let Ok(val) = env::var("BLOBS_CONF_CHUNK_TOKEN_SECRET") {
            if !val.is_empty() {
                self.chunk_token_secret = Some(val);
            }
        }
    }

    /// Reject values the subsystem cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.minimum_size_for_blob_provider_in_bytes < 0 {
            return Err(BlobStorageError::Configuration(
                "minimum_size_for_blob_provider_in_bytes must not be negative".to_string(),
            ));
        }
        if self.binary_cache_size < 0 {
            return Err(BlobStorageError::Configuration(
                "binary_cache_size must not be negative".to_string(),
            ));
        }
        if self.binary_buffer_size == 0 {
            return Err(BlobStorageError::Configuration(
                "binary_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.staging_grace_period_minutes == 0 {
            return Err(BlobStorageError::Configuration(
                "staging_grace_period_minutes must be greater than 0".to_string(),
            ));
        }
        if self.provider_delete_timeout_seconds == 0 {
            return Err(BlobStorageError::Configuration(
                "provider_delete_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cleanup_grace_period(&self) -> Duration {
        Duration::from_secs(self.cleanup_grace_period_minutes.saturating_mul(60))
    }

    pub fn staging_grace_period(&self) -> Duration {
        Duration::from_secs(self.staging_grace_period_minutes.saturating_mul(60))
    }

    pub fn provider_delete_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_delete_timeout_seconds)
    }

    pub fn cleanup_delay(&self) -> Option<Duration> {
        self.cleanup_delay_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = BlobStorageConfig::default();

        assert_eq!(config.minimum_size_for_blob_provider_in_bytes, 500_000);
        assert_eq!(config.binary_cache_size, 1_000_000);
        assert_eq!(config.cleanup_grace_period(), Duration::from_secs(30 * 60));
        assert!(config.external_provider.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blobs.json");
        std::fs::write(
            &path,
            r#"{"binary_cache_size": 2048, "external_provider": "LocalBlobProvider"}"#,
        )
        .unwrap();

        let config = BlobStorageConfig::load(Some(&path)).unwrap();

        assert_eq!(config.binary_cache_size, 2048);
        assert_eq!(config.external_provider.as_deref(), Some("LocalBlobProvider"));
        assert_eq!(config.binary_buffer_size, DEFAULT_BINARY_BUFFER_SIZE);
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        let config = BlobStorageConfig {
            binary_buffer_size: 0,
            ..BlobStorageConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_grace_periods_saturate() {
        let config = BlobStorageConfig {
            cleanup_grace_period_minutes: u64::MAX,
            staging_grace_period_minutes: u64::MAX,
            ..BlobStorageConfig::default()
        };

        assert_eq!(config.cleanup_grace_period(), Duration::from_secs(u64::MAX));
        assert_eq!(config.staging_grace_period(), Duration::from_secs(u64::MAX));
    }
}
