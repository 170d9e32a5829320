//! Sync configuration: where the remote databases live, how replication
//! runs, and how failed writes are retried.
//!
//! ```toml
//! root_url = "https://couch.example.org/"
//!
//! [replication]
//! continuous = true
//! interval_ms = 1000
//! batch_size = 100
//!
//! [retry]
//! max_attempts = 3
//! base_backoff_ms = 200
//! max_backoff_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid sync config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How each collection replicates with its remote database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Run replication on a background thread. When false, replication only
    /// happens through explicit `sync_now` calls.
    pub continuous: bool,
    /// Pause between passes of the background thread.
    pub interval_ms: u64,
    /// Changes fetched per change-feed page.
    pub batch_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            continuous: true,
            interval_ms: 1000,
            batch_size: 100,
        }
    }
}

impl ReplicationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Retry schedule for writes that failed transiently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per write, counting the first one.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let millis = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Top-level configuration for a [`crate::SyncManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Prefix of every remote database URL; the collection name is appended
    /// with no separator.
    pub root_url: String,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SyncConfig {
    pub fn new(root_url: impl Into<String>) -> Self {
        Self {
            root_url: root_url.into(),
            replication: ReplicationConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Replication only runs when driven explicitly.
    pub fn manual(mut self) -> Self {
        self.replication.continuous = false;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.replication.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.replication.batch_size = size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
