//! TaskStore port - the source of truth for task state.
//!
//! Every status transition (claim, start, complete, cancel, requeue) and
//! its audit-log row happen in one transaction inside the store. Workers
//! and the control panel only ever go through this trait.
//!
//! Implementations:
//! - [`SqliteTaskStore`](crate::queue::SqliteTaskStore): durable, shared
//!   between processes through SQLite locking.
//! - [`InMemoryTaskStore`](crate::queue::InMemoryTaskStore): tests and demos.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{
    NewTask, Task, TaskId, TaskLogEntry, TaskResult, TaskType, WorkerHeartbeat, WorkerId,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::queue::{ClaimStrategy, TaskStatus};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a `queued` task.
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, StoreError>;

    /// Atomically select the next claimable task and assign it to `worker_id`.
    ///
    /// Claimable means `queued` with `run_after` unset or in the past, and a
    /// `task_type` in `task_types` (empty slice = any type). Two concurrent
    /// callers never receive the same task.
    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        strategy: ClaimStrategy,
        task_types: &[TaskType],
    ) -> Result<Option<Task>, StoreError>;

    /// `claimed -> running`. Fails with `InvalidTransition` when the task was
    /// cancelled after the claim.
    async fn start(&self, task_id: TaskId, worker_id: &WorkerId) -> Result<Task, StoreError>;

    /// Record the outcome of a claimed task and return its new status.
    ///
    /// A failure with retries left goes back to `queued` with
    /// `retry_count + 1`; otherwise it is terminally `failed`. Fails with
    /// `Ownership` (task untouched) when `worker_id` does not hold the claim.
    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        result: &TaskResult,
    ) -> Result<TaskStatus, StoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Newest first.
    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;

    /// Only `queued` and `claimed` tasks can be cancelled; returns whether it was.
    async fn cancel(&self, task_id: TaskId) -> Result<bool, StoreError>;

    async fn heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerHeartbeat>, StoreError>;

    /// Oldest first.
    async fn task_log(&self, task_id: TaskId) -> Result<Vec<TaskLogEntry>, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    /// Release claims held by workers whose heartbeat is older than
    /// `stale_after` (or missing) and whose claim is at least that old.
    /// Each release counts as a retry.
    async fn requeue_abandoned(&self, stale_after: Duration) -> Result<Vec<TaskId>, StoreError>;
}
