//! Liveness heartbeat
//!
//! The engine refreshes a timestamp on a fixed period; the UI shows the
//! engine as active while that timestamp is younger than the stale window.

use crate::clock::Clock;
use crate::store::{keys, StorageItem, Store, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shortest period [`HeartbeatPublisher::spawn`] accepts
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub const HEARTBEAT_ITEM: StorageItem<HeartbeatRecord> = StorageItem::new(keys::HEARTBEAT);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub time: u64,
}

impl HeartbeatRecord {
    /// Was this heartbeat written less than `stale_after` before `now`?
    pub fn is_fresh(&self, now: u64, stale_after: Duration) -> bool {
        now.saturating_sub(self.time) < stale_after.as_millis() as u64
    }
}

pub struct HeartbeatPublisher {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl HeartbeatPublisher {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Write the current time.
    pub fn tick(&self) -> Result<HeartbeatRecord, StoreError> {
        let record = HeartbeatRecord {
            time: self.clock.now_ms(),
        };
        HEARTBEAT_ITEM.set(self.store.as_ref(), &record)?;
        Ok(record)
    }

    /// Last heartbeat written by any publisher
    pub fn latest(&self) -> Option<HeartbeatRecord> {
        HEARTBEAT_ITEM.get(self.store.as_ref()).ok().flatten()
    }

    /// Tick immediately, then every `interval`, until the task is aborted.
    /// Periods below [`MIN_HEARTBEAT_INTERVAL`] are raised to it.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let period = if interval < MIN_HEARTBEAT_INTERVAL {
            warn!("Heartbeat interval {:?} too short, using {:?}", interval, MIN_HEARTBEAT_INTERVAL);
            MIN_HEARTBEAT_INTERVAL
        } else {
            interval
        };

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;

                match self.tick() {
                    Ok(record) => debug!("Heartbeat at {}", record.time),
                    Err(e) => warn!("Failed to publish heartbeat: {}", e),
                }
            }
        })
    }
}
