use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::WorkerHeartbeat;
use crate::queue::TaskStatus;

/// Task totals per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub claimed: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Queued => self.queued += n,
            TaskStatus::Claimed => self.claimed += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.claimed + self.running + self.completed + self.failed + self.cancelled
    }

    /// Tasks not yet in a terminal state.
    pub fn in_flight(&self) -> usize {
        self.queued + self.claimed + self.running
    }
}

/// Heartbeats older than `threshold`. Worker failure is only ever visible
/// this way; nothing pushes a notification.
pub fn stale_workers(
    heartbeats: &[WorkerHeartbeat],
    now: DateTime<Utc>,
    threshold: Duration,
) -> Vec<&WorkerHeartbeat> {
    heartbeats
        .iter()
        .filter(|beat| beat.is_stale(now, threshold))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::WorkerId;
    use crate::queue::ClaimStrategy;

    #[test]
    fn counts_accumulate_per_status() {
        let mut counts = QueueCounts::default();
        counts.add(TaskStatus::Queued, 2);
        counts.add(TaskStatus::Running, 1);
        counts.add(TaskStatus::Failed, 4);
        assert_eq!(counts.total(), 7);
        assert_eq!(counts.in_flight(), 3);
    }

    #[test]
    fn stale_workers_filters_by_age() {
        let now = Utc::now();
        let beat = |id: &str, secs_ago: i64| WorkerHeartbeat {
            worker_id: WorkerId::new(id),
            last_heartbeat: now - chrono::Duration::seconds(secs_ago),
            tasks_processed: 0,
            tasks_failed: 0,
            current_task_id: None,
            strategy: ClaimStrategy::Fifo,
        };
        let beats = vec![beat("fresh", 5), beat("old", 600)];
        let stale = stale_workers(&beats, now, Duration::from_secs(120));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].worker_id.as_str(), "old");
    }
}
