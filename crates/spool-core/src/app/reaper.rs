//! Reaper - releases claims held by workers that stopped heartbeating.
//!
//! A crashed worker leaves its task `claimed`/`running` forever; the
//! reaper puts such tasks back through the normal retry decision. The old
//! owner's late `complete()` then fails with an ownership error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::worker::StopHandle;
use crate::domain::TaskId;
use crate::error::StoreError;
use crate::ports::TaskStore;

pub struct Reaper {
    store: Arc<dyn TaskStore>,
    stale_after: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn TaskStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub async fn run_once(&self) -> Result<Vec<TaskId>, StoreError> {
        self.store.requeue_abandoned(self.stale_after).await
    }

    /// Sweep every `interval` until `stop` fires. Store errors are logged
    /// and the next sweep tries again.
    pub async fn run(&self, interval: Duration, stop: &StopHandle) -> u64 {
        let mut stop_rx = stop.subscribe();
        let mut released = 0u64;
        info!(stale_after = ?self.stale_after, ?interval, "reaper starting");
        while !stop.is_stopped() {
            match self.run_once().await {
                Ok(ids) => released += ids.len() as u64,
                Err(err) => warn!(error = %err, "reaper sweep failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.wait_for(|stopped| *stopped) => break,
            }
        }
        info!(released, "reaper stopped");
        released
    }
}
