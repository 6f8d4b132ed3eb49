//! Release of expired edit locks.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use fieldsync_common::{EntityId, EntityType, Result};
use fieldsync_storage::LocalStore;

/// Scans locally locked records and releases those whose TTL elapsed.
///
/// Local only; the release reaches other devices through the normal sync cycle.
pub struct LockSweeper {
    store: Arc<dyn LocalStore>,
}

impl LockSweeper {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Release every lock older than `ttl`.
    pub fn sweep(&self, ttl: Duration) -> Result<Vec<EntityId>> {
        self.sweep_at(ttl, Utc::now())
    }

    /// Release every lock with `locked_at + ttl <= now`.
    pub fn sweep_at(&self, ttl: Duration, now: DateTime<Utc>) -> Result<Vec<EntityId>> {
        let mut released = Vec::new();

        for entity_type in EntityType::ALL {
            for record in self.store.locked_records(entity_type)? {
                if !record.lock_expired(ttl, now) {
                    continue;
                }
                // Only the lock columns change, so an edit made since the scan survives.
                if self.store.release_lock(entity_type, &record.id)? {
                    debug!(
                        "Released lock on {} {} held by {:?}",
                        entity_type, record.id, record.locked_by
                    );
                    released.push(record.id);
                }
            }
        }

        if !released.is_empty() {
            info!("Released {} expired locks", released.len());
        }
        Ok(released)
    }
}
