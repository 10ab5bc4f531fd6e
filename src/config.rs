//! Broker configuration.
//!
//! Tunables for the cache limits, the garbage-collection age threshold, and
//! the filler pool, loadable from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Configuration of one list broker instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Hard upper limit on the summed size of cached lists, in bytes.
    pub memory_hard_limit: usize,
    /// Soft memory watermark in permil of the hard limit.
    pub memory_high_permil: u32,
    /// Low memory watermark in permil of the hard limit; garbage collection
    /// discards until memory drops below it.
    pub memory_low_permil: u32,

    /// Hard upper limit on the number of cached lists.
    pub count_hard_limit: usize,
    pub count_high_permil: u32,
    pub count_low_permil: u32,

    /// How long an unused list stays cached, in minutes.
    pub maximum_age_minutes: u64,

    /// Worker threads per filler pool.
    pub filler_threads: usize,
    /// Drain the filler queue after every scheduling operation.
    pub synchronous_fillers: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            memory_hard_limit: 4 * 1024 * 1024,
            memory_high_permil: 900,
            memory_low_permil: 400,
            count_hard_limit: 1000,
            count_high_permil: 900,
            count_low_permil: 400,
            maximum_age_minutes: 10,
            filler_threads: 4,
            synchronous_fillers: false,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_hard_limit == 0 || self.count_hard_limit == 0 {
            return Err(ConfigError::Validation(
                "hard limits must be positive".into(),
            ));
        }

        for (what, high, low) in [
            ("memory", self.memory_high_permil, self.memory_low_permil),
            ("count", self.count_high_permil, self.count_low_permil),
        ] {
            if high > 1000 || low > 1000 {
                return Err(ConfigError::Validation(format!(
                    "{} watermarks must not exceed 1000 permil",
                    what
                )));
            }

            if low >= high {
                return Err(ConfigError::Validation(format!(
                    "{} low watermark must lie below the high watermark",
                    what
                )));
            }
        }

        if self.maximum_age_minutes == 0 {
            return Err(ConfigError::Validation(
                "maximum age must be positive".into(),
            ));
        }

        if self.filler_threads == 0 {
            return Err(ConfigError::Validation(
                "at least one filler thread is required".into(),
            ));
        }

        Ok(())
    }

    pub fn maximum_age(&self) -> Duration {
        Duration::from_secs(self.maximum_age_minutes * 60)
    }
}
