//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use fieldsync_common::{Error, Result};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delivery attempts after which a queued operation is abandoned.
    pub max_retry_attempts: u32,
    /// Base delay of the push backoff.
    pub retry_backoff_base: Duration,
    /// Cap for a single backoff delay.
    pub max_backoff: Duration,
    /// Rows requested per delta page.
    pub page_size: usize,
    /// How long an edit lock stays valid.
    pub lock_ttl: Duration,
    /// Interval of the periodic sync trigger.
    pub sync_interval: Duration,
    /// Buffered events per subscriber.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            retry_backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            page_size: 1000,
            lock_ttl: Duration::from_secs(30 * 60),
            sync_interval: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_retry_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidInput("page_size must be at least 1".to_string()));
        }
        if self.sync_interval.is_zero() {
            return Err(Error::InvalidInput("sync_interval must be non-zero".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidInput("event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}
