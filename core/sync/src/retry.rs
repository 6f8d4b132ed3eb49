//! Backoff policy for failed push deliveries.

use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::config::SyncConfig;

/// Configuration for push retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after which an operation is abandoned.
    pub max_attempts: u32,
    /// Base delay; the n-th backoff waits `base_delay * 2^(attempts - 2)`.
    pub base_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Failures tolerated before the push loop starts backing off.
    pub free_attempts: u32,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            free_attempts: 2,
        }
    }

    /// Build from the engine configuration.
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self::new(config.max_retry_attempts)
            .with_base_delay(config.retry_backoff_base)
            .with_max_delay(config.max_backoff)
    }

    /// Set base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Whether an operation with this many failed attempts is given up.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay to wait after the `attempts`-th failure, if any.
    pub fn backoff_for(&self, attempts: u32) -> Option<Duration> {
        if attempts <= self.free_attempts {
            return None;
        }
        let exponent = attempts - self.free_attempts;
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    /// Sleep for the backoff belonging to `attempts`.
    pub async fn pause(&self, attempts: u32) {
        if let Some(delay) = self.backoff_for(attempts) {
            debug!("Backing off {:?} after {} failed attempts", delay, attempts);
            sleep(delay).await;
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_sync_config(&SyncConfig::default())
    }
}
