//! Append-only audit trail of task state changes.
//!
//! Each entry is written in the same transaction as the change it records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{TaskId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Claimed,
    Started,
    Completed,
    Failed,
    /// Returned to the queue for another attempt.
    Requeued,
    Cancelled,
}

impl TaskEvent {
    const ALL: [TaskEvent; 6] = [
        TaskEvent::Claimed,
        TaskEvent::Started,
        TaskEvent::Completed,
        TaskEvent::Failed,
        TaskEvent::Requeued,
        TaskEvent::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskEvent::Claimed => "claimed",
            TaskEvent::Started => "started",
            TaskEvent::Completed => "completed",
            TaskEvent::Failed => "failed",
            TaskEvent::Requeued => "requeued",
            TaskEvent::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("unknown task event {s:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub id: i64,
    pub task_id: TaskId,
    pub event: TaskEvent,
    pub worker_id: Option<WorkerId>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}
