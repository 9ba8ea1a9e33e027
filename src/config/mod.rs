//! Configuration consumed by the counter core.
//!
//! The config is a plain JSON document (see `conf/counter.json`). The embedding
//! service decides where it comes from - a file, environment, whatever - the
//! core only cares about the parsed [`Config`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Addresses of the backing storage nodes. The topology is fixed at startup.
    pub storage_nodes: Vec<String>,
    /// Virtual positions per physical node on the hash ring
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Upper bound for a single storage round trip
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// How often unhealthy nodes are re-checked with a liveness probe
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// How long the final flush may run during shutdown before remaining
    /// deltas are dropped (and counted as dropped in the metrics)
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CacheConfig {
    /// Entries older than this are treated as absent
    pub ttl_ms: u64,
    /// Maximum number of cached entries; inserting beyond it evicts the LRU entry
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Interval between flush cycles
    pub interval_ms: u64,
    /// Pending-buffer size that triggers an out-of-cycle flush
    pub size_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
        }
    }
}

fn default_virtual_nodes() -> usize {
    100
}

fn default_operation_timeout_ms() -> u64 {
    5000
}

fn default_probe_interval_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

impl Config {
    pub async fn from_file(path: PathBuf) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_nodes.is_empty() {
            return Err(Error::NoAvailableNode);
        }

        if self.virtual_nodes == 0 {
            return Err(Error::InvalidConfig {
                reason: "virtual_nodes must be at least 1".to_string(),
            });
        }

        if self.cache.capacity == 0 {
            return Err(Error::InvalidConfig {
                reason: "cache capacity must be at least 1".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                reason: "retry max_attempts must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache.ttl_ms)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch.interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn retry_base_backoff(&self) -> Duration {
        Duration::from_millis(self.retry.base_backoff_ms)
    }
}
