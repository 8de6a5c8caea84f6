use rusqlite::ErrorCode;
use thiserror::Error;

use crate::domain::{TaskId, TaskType, WorkerId};
use crate::queue::TaskStatus;

/// Errors surfaced by a [`TaskStore`](crate::ports::TaskStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lock contention outlasted the busy policy. Pollers treat this as an
    /// empty tick.
    #[error("store busy after {attempts} attempts")]
    Busy { attempts: u32 },

    /// The caller does not hold the claim on this task.
    #[error("task {task_id} is claimed by {}, not {worker_id}", display_owner(.claimed_by))]
    Ownership {
        task_id: TaskId,
        worker_id: WorkerId,
        claimed_by: Option<WorkerId>,
    },

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("invalid task type {0:?}")]
    InvalidTaskType(String),

    #[error("unsupported schema version {found} (expected at most {supported})")]
    SchemaVersion { found: i64, supported: i64 },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

fn display_owner(owner: &Option<WorkerId>) -> String {
    match owner {
        Some(worker_id) => worker_id.to_string(),
        None => "nobody".to_string(),
    }
}

impl StoreError {
    /// True for lock contention, both the raw SQLite form and the
    /// exhausted-retries form.
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Busy { .. } => true,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            }
            _ => false,
        }
    }
}

/// Failure raised by a task handler. Always converted into a failed
/// `TaskResult`; it never escapes the worker.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Failure talking to the external coordination service. Logged and dropped.
#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("invalid reporter configuration: {0}")]
    InvalidConfig(String),

    #[error("reporter unreachable: {0}")]
    Unreachable(String),

    #[error("reporter rejected report with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("reporter timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("reporter transport: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate handler for task_type={0}")]
    DuplicateHandler(TaskType),

    #[error("invalid task type {0:?}: use 1-128 chars of [A-Za-z0-9_.:-]")]
    InvalidTaskType(String),

    #[error("missing handlers for task types: {0:?}")]
    MissingTaskTypes(Vec<String>),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker has no registered handlers")]
    NoHandlers,

    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeatInterval,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
