//! ExternalReporter port - optional mirror of completions to a remote
//! coordination service.
//!
//! The local store stays authoritative. Reports are fire-and-forget: the
//! worker logs a failed report and moves on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{TaskId, TaskType, WorkerId};
use crate::error::ReporterError;
use crate::queue::TaskStatus;

/// Body of a completion notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub task_type: TaskType,
    pub success: bool,
    /// Status the store settled on (`completed`, `queued` for a retry, `failed`).
    pub status: TaskStatus,
    pub items_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExternalReporter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn report_completion(&self, report: &CompletionReport) -> Result<(), ReporterError>;
}

/// Local-only mode: accepts every report and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

#[async_trait]
impl ExternalReporter for NoopReporter {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn report_completion(&self, _report: &CompletionReport) -> Result<(), ReporterError> {
        Ok(())
    }
}
