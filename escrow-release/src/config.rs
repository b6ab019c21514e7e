//! Configuration for the escrow release scheduler

use serde::{Deserialize, Serialize};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Job name recorded in JobRun rows and guarding the lease
    pub job_name: String,

    /// Sweep interval (seconds); fixed-interval polling, not wall-clock precise
    pub interval_secs: u64,

    /// Maximum rows released per run (earliest release first)
    pub batch_limit: usize,

    /// Lease duration (seconds); an instance crash frees the job after this
    pub lease_ttl_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            job_name: "escrow_release".to_string(),
            interval_secs: 60,
            batch_limit: 100,
            // Twice the interval, so one missed tick never loses the lease
            lease_ttl_secs: 120,
        }
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

        if let Ok(interval) = std::env::var("ESCROW_SWEEP_INTERVAL_SECS") {
            config.interval_secs = interval
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid interval: {}", e)))?;
        }

        if let Ok(limit) = std::env::var("ESCROW_SWEEP_BATCH_LIMIT") {
            config.batch_limit = limit
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid batch limit: {}", e)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.job_name, "escrow_release");
        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.batch_limit, 100);
        assert!(config.lease_ttl_secs >= 2 * config.interval_secs as i64);
    }
}
