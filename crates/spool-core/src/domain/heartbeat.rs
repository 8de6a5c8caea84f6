//! Worker liveness records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{TaskId, WorkerId};
use crate::ports::clock::to_chrono;
use crate::queue::ClaimStrategy;

/// One row per worker, upserted on every idle tick and after every task.
///
/// Rows are never deleted; a dead worker is recognised by the age of
/// `last_heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: WorkerId,
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub current_task_id: Option<TaskId>,
    pub strategy: ClaimStrategy,
}

impl WorkerHeartbeat {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > to_chrono(threshold)
    }
}
