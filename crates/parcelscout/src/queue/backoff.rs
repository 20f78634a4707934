use std::time::Duration;

use crate::config::QueueConfig;

/// Exponential retry delay: `base * 2^attempt`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            Duration::from_secs(config.backoff_base_secs),
            Duration::from_secs(config.backoff_cap_secs),
        )
    }

    /// Delay before retrying a job that has failed `attempt` times before
    /// this failure (0 for the first failure).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(900))
    }
}
