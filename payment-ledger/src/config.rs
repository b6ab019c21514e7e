//! Configuration for the payment ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// RocksDB configuration
    pub rocksdb: RocksDbConfig,

    /// Daily unlock quota configuration
    pub quota: QuotaConfig,

    /// Webhook intake configuration
    pub webhook: WebhookConfig,

    /// Tier cache configuration
    pub tier_cache: TierCacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/payment-ledger"),
            service_name: "payment-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
            rocksdb: RocksDbConfig::default(),
            quota: QuotaConfig::default(),
            webhook: WebhookConfig::default(),
            tier_cache: TierCacheConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Daily unlock quota configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Maximum unlock attempts in created/succeeded status per user per UTC day
    pub daily_unlock_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_unlock_limit: 3,
        }
    }
}

/// Webhook intake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Admissions allowed per event before dead-lettering
    pub max_attempts: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

/// Tier cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierCacheConfig {
    /// Cache entry time-to-live (seconds)
    pub ttl_secs: u64,
}

impl Default for TierCacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("LEDGER_METRICS_ADDR") {
            config.metrics_listen_addr = addr;
        }

        if let Ok(limit) = std::env::var("LEDGER_DAILY_UNLOCK_LIMIT") {
            config.quota.daily_unlock_limit = limit
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid unlock limit: {}", e)))?;
        }

        if let Ok(attempts) = std::env::var("LEDGER_WEBHOOK_MAX_ATTEMPTS") {
            config.webhook.max_attempts = attempts
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid max attempts: {}", e)))?;
        }

        Ok(config)
    }
}
