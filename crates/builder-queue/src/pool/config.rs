use std::time::Duration;

use crate::retry::RetryScheduler;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_builders must be at least 1")]
    ZeroBuilders,
    /// Builders are only created to top up the reserve, so an empty reserve
    /// target would leave every checkout waiting forever.
    #[error("max_reserve_builders must be at least 1")]
    ZeroReserve,
    #[error("max_reserve_builders ({reserve}) exceeds max_builders ({max})")]
    ReserveExceedsMax { reserve: usize, max: usize },
}

/// Capacity limits and retry timing for a [`BuilderPool`](super::BuilderPool).
///
/// Limits are fixed once the pool starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Ceiling on reserve + in-flight creations + active builders.
    pub max_builders: usize,
    /// Target size of the warm reserve.
    pub max_reserve_builders: usize,
    /// Delay before a failed create or destroy is retried.
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_builders: 1,
            max_reserve_builders: 1,
            retry_delay: RetryScheduler::DEFAULT_DELAY,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_builders(mut self, n: usize) -> Self {
        self.max_builders = n;
        self
    }

    pub fn with_max_reserve_builders(mut self, n: usize) -> Self {
        self.max_reserve_builders = n;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_builders == 0 {
            return Err(ConfigError::ZeroBuilders);
        }
        // A pool with no reserve target never provisions, so checkouts would wait forever.
        if self.max_reserve_builders == 0 {
            return Err(ConfigError::ZeroReserve);
        }
        if self.max_reserve_builders > self.max_builders {
            return Err(ConfigError::ReserveExceedsMax {
                reserve: self.max_reserve_builders,
                max: self.max_builders,
            });
        }
        Ok(())
    }
}
