//! In-memory task store.
//!
//! Same transitions and audit rows as the SQLite store, held behind one
//! async mutex. Nothing survives the process; meant for tests, demos and
//! single-process setups that do not need durability.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::retry::{FailureDisposition, RetryPolicy};
use super::strategy::{Candidate, ClaimStrategy};
use super::TaskStatus;
use crate::domain::{
    NewTask, Task, TaskEvent, TaskId, TaskLogEntry, TaskResult, TaskType, WorkerHeartbeat,
    WorkerId,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;
use crate::ports::clock::to_chrono;
use crate::ports::{Clock, SystemClock, TaskStore};

struct InMemoryState {
    /// All tasks, keyed (and therefore ordered) by id.
    tasks: BTreeMap<TaskId, Task>,

    logs: Vec<TaskLogEntry>,

    heartbeats: BTreeMap<WorkerId, WorkerHeartbeat>,

    next_task_id: i64,
    next_log_id: i64,
}

impl InMemoryState {
    fn new() -> Self {
        Self {
            tasks: BTreeMap::new(),
            logs: Vec::new(),
            heartbeats: BTreeMap::new(),
            next_task_id: 1,
            next_log_id: 1,
        }
    }

    fn allocate_task_id(&mut self) -> TaskId {
        let id = TaskId::new(self.next_task_id);
        self.next_task_id += 1;
        id
    }

    fn append_log(
        &mut self,
        task_id: TaskId,
        event: TaskEvent,
        worker_id: Option<&WorkerId>,
        message: Option<String>,
        at: DateTime<Utc>,
    ) {
        let id = self.next_log_id;
        self.next_log_id += 1;
        self.logs.push(TaskLogEntry {
            id,
            task_id,
            event,
            worker_id: worker_id.cloned(),
            message,
            created_at: at,
        });
    }

    fn owned_task_mut(
        &mut self,
        task_id: TaskId,
        worker_id: &WorkerId,
    ) -> Result<&mut Task, StoreError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        if !task.is_owned_by(worker_id) {
            return Err(StoreError::Ownership {
                task_id,
                worker_id: worker_id.clone(),
                claimed_by: task.claimed_by.clone(),
            });
        }
        Ok(task)
    }

    fn fail_or_requeue(
        &mut self,
        task_id: TaskId,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
        error: String,
        data: Option<serde_json::Value>,
    ) -> Result<TaskStatus, StoreError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        match retry.decide(task.retry_count, task.max_retries, now) {
            FailureDisposition::Requeue {
                retry_count,
                run_after,
            } => {
                task.status = TaskStatus::Queued;
                task.retry_count = retry_count;
                task.run_after = run_after;
                task.claimed_by = None;
                task.claimed_at = None;
                task.error_message = Some(error);
                let note = format!("retry {retry_count} of {}", task.max_retries);
                self.append_log(task_id, TaskEvent::Requeued, None, Some(note), now);
                Ok(TaskStatus::Queued)
            }
            FailureDisposition::Fail => {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
                task.error_message = Some(error);
                task.result_data = data;
                Ok(TaskStatus::Failed)
            }
        }
    }
}

pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryState>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::new())),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, new: NewTask) -> Result<TaskId, StoreError> {
        if !new.task_type.is_valid() {
            return Err(StoreError::InvalidTaskType(new.task_type.to_string()));
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let id = state.allocate_task_id();
        state.tasks.insert(
            id,
            Task {
                id,
                task_type: new.task_type,
                parameters: new.parameters,
                priority: new.priority,
                status: TaskStatus::Queued,
                retry_count: 0,
                max_retries: new.max_retries,
                run_after: new.run_after,
                created_at: now,
                claimed_at: None,
                completed_at: None,
                claimed_by: None,
                error_message: None,
                result_data: None,
            },
        );
        Ok(id)
    }

    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        strategy: ClaimStrategy,
        task_types: &[TaskType],
    ) -> Result<Option<Task>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let candidates: Vec<Candidate> = state
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Queued)
            .filter(|task| task.run_after.is_none_or(|at| at <= now))
            .filter(|task| task_types.is_empty() || task_types.contains(&task.task_type))
            .map(|task| Candidate {
                id: task.id,
                priority: task.priority,
                created_at: task.created_at,
            })
            .collect();

        let Some(task_id) = strategy.select(&candidates, &mut rand::thread_rng()) else {
            return Ok(None);
        };
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Claimed;
        task.claimed_by = Some(worker_id.clone());
        task.claimed_at = Some(now);
        let claimed = task.clone();
        state.append_log(task_id, TaskEvent::Claimed, Some(worker_id), None, now);
        Ok(Some(claimed))
    }

    async fn start(&self, task_id: TaskId, worker_id: &WorkerId) -> Result<Task, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.owned_task_mut(task_id, worker_id)?;
        if task.status != TaskStatus::Claimed {
            return Err(StoreError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        task.status = TaskStatus::Running;
        let started = task.clone();
        state.append_log(task_id, TaskEvent::Started, Some(worker_id), None, now);
        Ok(started)
    }

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        result: &TaskResult,
    ) -> Result<TaskStatus, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.owned_task_mut(task_id, worker_id)?;
        if !task.status.is_owned() {
            return Err(StoreError::InvalidTransition {
                task_id,
                from: task.status,
                to: if result.success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                },
            });
        }

        match result.error_message() {
            None => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                task.result_data = result.data.clone();
                task.error_message = None;
                state.append_log(task_id, TaskEvent::Completed, Some(worker_id), None, now);
                Ok(TaskStatus::Completed)
            }
            Some(error) => {
                state.append_log(
                    task_id,
                    TaskEvent::Failed,
                    Some(worker_id),
                    Some(error.clone()),
                    now,
                );
                state.fail_or_requeue(task_id, &self.retry, now, error, result.data.clone())
            }
        }
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).cloned())
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| status.is_none_or(|s| task.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn cancel(&self, task_id: TaskId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if !task.status.is_cancellable() {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now);
        state.append_log(task_id, TaskEvent::Cancelled, None, None, now);
        Ok(true)
    }

    async fn heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .heartbeats
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.heartbeats.values().cloned().collect())
    }

    async fn task_log(&self, task_id: TaskId) -> Result<Vec<TaskLogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .filter(|entry| entry.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for task in state.tasks.values() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }

    async fn requeue_abandoned(&self, stale_after: Duration) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(stale_after);
        let mut state = self.state.lock().await;

        let abandoned: Vec<(TaskId, Option<WorkerId>)> = state
            .tasks
            .values()
            .filter(|task| task.status.is_owned())
            .filter(|task| task.claimed_at.is_some_and(|at| at <= cutoff))
            .filter(|task| {
                let alive = task
                    .claimed_by
                    .as_ref()
                    .and_then(|worker| state.heartbeats.get(worker))
                    .is_some_and(|beat| beat.last_heartbeat > cutoff);
                !alive
            })
            .map(|task| (task.id, task.claimed_by.clone()))
            .collect();

        let mut released = Vec::with_capacity(abandoned.len());
        for (task_id, owner) in abandoned {
            let owner_name = owner
                .as_ref()
                .map(WorkerId::to_string)
                .unwrap_or_else(|| "unknown worker".to_string());
            let error = format!("claim abandoned by {owner_name} (no heartbeat for {stale_after:?})");
            state.append_log(task_id, TaskEvent::Failed, owner.as_ref(), Some(error.clone()), now);
            state.fail_or_requeue(task_id, &self.retry, now, error, None)?;
            released.push(task_id);
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn store() -> (InMemoryTaskStore, ManualClock) {
        let clock = ManualClock::new(t0());
        let store = InMemoryTaskStore::new().with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    #[rstest]
    #[case(ClaimStrategy::Fifo, vec![1, 2, 3, 4])]
    #[case(ClaimStrategy::Lifo, vec![4, 3, 2, 1])]
    #[case(ClaimStrategy::Priority, vec![3, 2, 4, 1])]
    #[tokio::test]
    async fn strategies_drain_in_order(#[case] strategy: ClaimStrategy, #[case] expected: Vec<i64>) {
        let (store, clock) = store();
        for priority in [1, 5, 10, 5] {
            store
                .enqueue(NewTask::new("echo", json!({})).with_priority(priority))
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }

        let worker = WorkerId::new("w");
        let mut order = Vec::new();
        while let Some(task) = store.claim_next(&worker, strategy, &[]).await.unwrap() {
            order.push(task.id.get());
        }
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn lifecycle_writes_audit_trail() {
        let (store, _clock) = store();
        let worker = WorkerId::new("w");
        let id = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();

        store.claim_next(&worker, ClaimStrategy::Fifo, &[]).await.unwrap();
        store.start(id, &worker).await.unwrap();
        let status = store
            .complete(id, &worker, &TaskResult::success(1))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let events: Vec<_> = store
            .task_log(id)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.event)
            .collect();
        assert_eq!(
            events,
            vec![TaskEvent::Claimed, TaskEvent::Started, TaskEvent::Completed]
        );
    }

    #[tokio::test]
    async fn failure_requeues_until_retries_run_out() {
        let (store, _clock) = store();
        let worker = WorkerId::new("w");
        let id = store
            .enqueue(NewTask::new("flaky", json!({})).with_max_retries(1))
            .await
            .unwrap();

        store.claim_next(&worker, ClaimStrategy::Fifo, &[]).await.unwrap();
        let first = store.complete(id, &worker, &TaskResult::failure("x")).await.unwrap();
        store.claim_next(&worker, ClaimStrategy::Fifo, &[]).await.unwrap();
        let second = store.complete(id, &worker, &TaskResult::failure("y")).await.unwrap();

        assert_eq!((first, second), (TaskStatus::Queued, TaskStatus::Failed));
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error_message.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn foreign_worker_cannot_complete() {
        let (store, _clock) = store();
        let id = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store
            .claim_next(&WorkerId::new("a"), ClaimStrategy::Fifo, &[])
            .await
            .unwrap();

        let err = store
            .complete(id, &WorkerId::new("b"), &TaskResult::success(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Ownership { .. }));
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            TaskStatus::Claimed
        );
    }

    #[tokio::test]
    async fn stale_claims_are_released() {
        let (store, clock) = store();
        let id = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store
            .claim_next(&WorkerId::new("gone"), ClaimStrategy::Fifo, &[])
            .await
            .unwrap();

        assert!(store.requeue_abandoned(Duration::from_secs(60)).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(61));
        assert_eq!(
            store.requeue_abandoned(Duration::from_secs(60)).await.unwrap(),
            vec![id]
        );
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
    }
}
