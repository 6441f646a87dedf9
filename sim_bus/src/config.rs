//! Bus configuration

use crate::pool::SLICE_HEADER_SIZE;
use quota::{QuotaError, QuotaLimits};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse bus config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Limits(#[from] QuotaError),

    #[error("Pool size {pool_size} cannot hold a single message")]
    PoolTooSmall { pool_size: u64 },
}

/// Settings applied to every connection of a bus
///
/// Missing fields fall back to the kdbus defaults, so `{}` is a valid
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Receive pool capacity per connection, in bytes
    pub pool_size: u64,
    pub limits: QuotaLimits,
}

impl BusConfig {
    pub const DEFAULT_POOL_SIZE: u64 = 16 * 1024 * 1024;

    /// Builder: sets the per-connection pool size
    pub fn with_pool_size(mut self, pool_size: u64) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Builder: sets the quota limits
    pub fn with_limits(mut self, limits: QuotaLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Parses and validates a JSON configuration
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        if self.pool_size < SLICE_HEADER_SIZE {
            return Err(ConfigError::PoolTooSmall {
                pool_size: self.pool_size,
            });
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            pool_size: Self::DEFAULT_POOL_SIZE,
            limits: QuotaLimits::default(),
        }
    }
}
