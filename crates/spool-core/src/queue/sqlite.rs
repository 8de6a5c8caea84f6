//! SQLite-backed task store.
//!
//! Design:
//! - One `Connection` per store handle behind a `std::sync::Mutex`; all SQL
//!   runs on the blocking pool so async workers never stall on disk I/O.
//! - Separate handles opened on the same file (one per worker process, or
//!   per worker in tests) contend through SQLite's own locking. Every
//!   state change runs in a `BEGIN IMMEDIATE` transaction, so the claim
//!   select-then-update cannot interleave with another writer.
//! - Busy/locked errors retry the whole transaction under [`BusyPolicy`].

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params,
    params_from_iter,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::retry::{BusyPolicy, FailureDisposition, RetryPolicy};
use super::schema;
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

const TASK_COLUMNS: &str = "id, task_type, parameters, priority, status, retry_count, max_retries, \
     run_after, created_at, claimed_at, completed_at, claimed_by, error_message, result_data";

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    busy: BusyPolicy,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the database at `path`. Failure here is
    /// fatal for a worker: there is no useful fallback without a store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(path, BusyPolicy::default())
    }

    pub fn open_with(path: impl AsRef<Path>, busy: BusyPolicy) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy.lock_wait)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        schema::bootstrap(&conn)?;
        info!(path = %path.display(), %journal_mode, "opened sqlite task store");
        Ok(Self::from_connection(conn, busy))
    }

    /// Private database, gone when the store is dropped.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        schema::bootstrap(&conn)?;
        Ok(Self::from_connection(conn, BusyPolicy::default()))
    }

    fn from_connection(conn: Connection, busy: BusyPolicy) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            busy,
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

    /// Run `f` on the blocking pool with the connection locked, retrying
    /// busy errors. `f` receives the current time on every attempt.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection, DateTime<Utc>) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let clock = Arc::clone(&self.clock);
        let busy = self.busy.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::Internal("sqlite connection lock poisoned".to_string()))?;
            retry_busy(op, &busy, || f(&mut *conn, clock.now()))
        })
        .await
        .map_err(|err| StoreError::Internal(format!("{op}: blocking task failed: {err}")))?
    }
}

fn retry_busy<T>(
    op: &'static str,
    policy: &BusyPolicy,
    mut attempt: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut rng = rand::thread_rng();
    let mut n = 0;
    loop {
        n += 1;
        match attempt() {
            Err(err) if err.is_busy() && n < max_attempts => {
                let delay = policy.delay_for(n, &mut rng);
                debug!(op, attempt = n, delay_ms = delay.as_millis() as u64, "database busy, retrying");
                std::thread::sleep(delay);
            }
            Err(err) if err.is_busy() => {
                warn!(op, attempts = n, "database still busy, giving up");
                return Err(StoreError::Busy { attempts: n });
            }
            other => return other,
        }
    }
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn to_u32(value: i64, what: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{what} out of range: {value}")))
}

fn to_u64(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{what} out of range: {value}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Raw column values; decoding happens outside the rusqlite callback so
/// JSON and enum errors map onto `StoreError`.
struct TaskRow {
    id: i64,
    task_type: String,
    parameters: String,
    priority: i32,
    status: String,
    retry_count: i64,
    max_retries: i64,
    run_after: Option<i64>,
    created_at: i64,
    claimed_at: Option<i64>,
    completed_at: Option<i64>,
    claimed_by: Option<String>,
    error_message: Option<String>,
    result_data: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            parameters: row.get(2)?,
            priority: row.get(3)?,
            status: row.get(4)?,
            retry_count: row.get(5)?,
            max_retries: row.get(6)?,
            run_after: row.get(7)?,
            created_at: row.get(8)?,
            claimed_at: row.get(9)?,
            completed_at: row.get(10)?,
            claimed_by: row.get(11)?,
            error_message: row.get(12)?,
            result_data: row.get(13)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|err| StoreError::Corrupt(format!("task {}: {err}", self.id)))?;
        Ok(Task {
            id: TaskId::new(self.id),
            task_type: TaskType::new(self.task_type),
            parameters: serde_json::from_str(&self.parameters)?,
            priority: self.priority,
            status,
            retry_count: to_u32(self.retry_count, "retry_count")?,
            max_retries: to_u32(self.max_retries, "max_retries")?,
            run_after: self.run_after.map(ms_to_dt).transpose()?,
            created_at: ms_to_dt(self.created_at)?,
            claimed_at: self.claimed_at.map(ms_to_dt).transpose()?,
            completed_at: self.completed_at.map(ms_to_dt).transpose()?,
            claimed_by: self.claimed_by.map(WorkerId::new),
            error_message: self.error_message,
            result_data: self
                .result_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }
}

fn fetch_task(conn: &Connection, task_id: TaskId) -> Result<Option<Task>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id.get()],
            TaskRow::from_row,
        )
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

fn fetch_owned_task(
    conn: &Connection,
    task_id: TaskId,
    worker_id: &WorkerId,
) -> Result<Task, StoreError> {
    let task = fetch_task(conn, task_id)?.ok_or(StoreError::NotFound(task_id))?;
    if !task.is_owned_by(worker_id) {
        return Err(StoreError::Ownership {
            task_id,
            worker_id: worker_id.clone(),
            claimed_by: task.claimed_by,
        });
    }
    Ok(task)
}

fn append_log(
    tx: &Transaction<'_>,
    task_id: TaskId,
    event: TaskEvent,
    worker_id: Option<&WorkerId>,
    message: Option<&str>,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO task_logs (task_id, event, worker_id, message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            task_id.get(),
            event.as_str(),
            worker_id.map(WorkerId::as_str),
            message,
            at.timestamp_millis()
        ],
    )?;
    Ok(())
}

fn claim_next_tx(
    conn: &mut Connection,
    now: DateTime<Utc>,
    worker_id: &WorkerId,
    strategy: ClaimStrategy,
    task_types: &[TaskType],
) -> Result<Option<Task>, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now_ms = now.timestamp_millis();

    let mut sql = String::from(
        "SELECT id, priority, created_at FROM tasks
         WHERE status = 'queued' AND (run_after IS NULL OR run_after <= ?1)",
    );
    let mut args = vec![SqlValue::Integer(now_ms)];
    if !task_types.is_empty() {
        let placeholders = (0..task_types.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND task_type IN ({placeholders})"));
        args.extend(
            task_types
                .iter()
                .map(|t| SqlValue::Text(t.as_str().to_string())),
        );
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(strategy.order_clause());
    if !strategy.is_sampled() {
        sql.push_str(" LIMIT 1");
    }

    let candidates = {
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i32>(1)?, row.get::<_, i64>(2)?))
        })?;
        let raw = rows.collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(id, priority, created_at)| {
                Ok(Candidate {
                    id: TaskId::new(id),
                    priority,
                    created_at: ms_to_dt(created_at)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?
    };

    let Some(task_id) = strategy.select(&candidates, &mut rand::thread_rng()) else {
        return Ok(None);
    };

    if !mark_claimed(&tx, task_id, worker_id, now_ms)? {
        warn!(%task_id, %worker_id, "selected task no longer queued, claim abandoned");
        return Ok(None);
    }
    append_log(&tx, task_id, TaskEvent::Claimed, Some(worker_id), None, now)?;
    let task = fetch_task(&tx, task_id)?.ok_or(StoreError::NotFound(task_id))?;
    tx.commit()?;
    Ok(Some(task))
}

/// Flip one `queued` row to `claimed`. `false` means the row was not
/// queued, so nothing changed.
fn mark_claimed(
    tx: &Transaction<'_>,
    task_id: TaskId,
    worker_id: &WorkerId,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let updated = tx.execute(
        "UPDATE tasks SET status = 'claimed', claimed_by = ?2, claimed_at = ?3
         WHERE id = ?1 AND status = 'queued'",
        params![task_id.get(), worker_id.as_str(), now_ms],
    )?;
    Ok(updated == 1)
}

fn start_tx(
    conn: &mut Connection,
    now: DateTime<Utc>,
    task_id: TaskId,
    worker_id: &WorkerId,
) -> Result<Task, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = fetch_owned_task(&tx, task_id, worker_id)?;
    if task.status != TaskStatus::Claimed {
        return Err(StoreError::InvalidTransition {
            task_id,
            from: task.status,
            to: TaskStatus::Running,
        });
    }
    tx.execute(
        "UPDATE tasks SET status = 'running' WHERE id = ?1",
        params![task_id.get()],
    )?;
    append_log(&tx, task_id, TaskEvent::Started, Some(worker_id), None, now)?;
    let task = fetch_task(&tx, task_id)?.ok_or(StoreError::NotFound(task_id))?;
    tx.commit()?;
    Ok(task)
}

/// Shared by `complete` and `requeue_abandoned`: apply the retry decision
/// to an owned task that just failed.
fn fail_or_requeue(
    tx: &Transaction<'_>,
    task: &Task,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
    error: &str,
    data: Option<&serde_json::Value>,
) -> Result<TaskStatus, StoreError> {
    match retry.decide(task.retry_count, task.max_retries, now) {
        FailureDisposition::Requeue {
            retry_count,
            run_after,
        } => {
            tx.execute(
                "UPDATE tasks
                 SET status = 'queued', retry_count = ?2, run_after = ?3,
                     claimed_by = NULL, claimed_at = NULL, error_message = ?4
                 WHERE id = ?1",
                params![
                    task.id.get(),
                    retry_count,
                    run_after.map(|t| t.timestamp_millis()),
                    error
                ],
            )?;
            let note = format!("retry {retry_count} of {}", task.max_retries);
            append_log(tx, task.id, TaskEvent::Requeued, None, Some(note.as_str()), now)?;
            Ok(TaskStatus::Queued)
        }
        FailureDisposition::Fail => {
            let data = data.map(serde_json::to_string).transpose()?;
            tx.execute(
                "UPDATE tasks
                 SET status = 'failed', completed_at = ?2, error_message = ?3, result_data = ?4
                 WHERE id = ?1",
                params![task.id.get(), now.timestamp_millis(), error, data],
            )?;
            Ok(TaskStatus::Failed)
        }
    }
}

fn complete_tx(
    conn: &mut Connection,
    now: DateTime<Utc>,
    task_id: TaskId,
    worker_id: &WorkerId,
    result: &TaskResult,
    retry: &RetryPolicy,
) -> Result<TaskStatus, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let task = fetch_owned_task(&tx, task_id, worker_id)?;
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

    let status = match result.error_message() {
        None => {
            let data = result.data.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "UPDATE tasks
                 SET status = 'completed', completed_at = ?2, result_data = ?3, error_message = NULL
                 WHERE id = ?1",
                params![task_id.get(), now.timestamp_millis(), data],
            )?;
            append_log(&tx, task_id, TaskEvent::Completed, Some(worker_id), None, now)?;
            TaskStatus::Completed
        }
        Some(error) => {
            append_log(&tx, task_id, TaskEvent::Failed, Some(worker_id), Some(error.as_str()), now)?;
            fail_or_requeue(&tx, &task, retry, now, &error, result.data.as_ref())?
        }
    };
    tx.commit()?;
    Ok(status)
}

fn cancel_tx(conn: &mut Connection, now: DateTime<Utc>, task_id: TaskId) -> Result<bool, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let changed = tx.execute(
        "UPDATE tasks SET status = 'cancelled', completed_at = ?2
         WHERE id = ?1 AND status IN ('queued', 'claimed')",
        params![task_id.get(), now.timestamp_millis()],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    append_log(&tx, task_id, TaskEvent::Cancelled, None, None, now)?;
    tx.commit()?;
    Ok(true)
}

fn requeue_abandoned_tx(
    conn: &mut Connection,
    now: DateTime<Utc>,
    stale_after: Duration,
    retry: &RetryPolicy,
) -> Result<Vec<TaskId>, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let cutoff_ms = (now - to_chrono(stale_after)).timestamp_millis();
    let abandoned = {
        let mut stmt = tx.prepare(
            "SELECT id FROM tasks t
             WHERE t.status IN ('claimed', 'running')
               AND t.claimed_at <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM worker_heartbeats h
                   WHERE h.worker_id = t.claimed_by AND h.last_heartbeat > ?1
               )
             ORDER BY t.id",
        )?;
        let rows = stmt.query_map(params![cutoff_ms], |row| row.get::<_, i64>(0))?;
        let ids = rows.collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let mut released = Vec::with_capacity(abandoned.len());
    for id in abandoned {
        let task_id = TaskId::new(id);
        let Some(task) = fetch_task(&tx, task_id)? else {
            continue;
        };
        let owner = task
            .claimed_by
            .as_ref()
            .map(WorkerId::to_string)
            .unwrap_or_else(|| "unknown worker".to_string());
        let error = format!("claim abandoned by {owner} (no heartbeat for {stale_after:?})");
        append_log(
            &tx,
            task_id,
            TaskEvent::Failed,
            task.claimed_by.as_ref(),
            Some(error.as_str()),
            now,
        )?;
        fail_or_requeue(&tx, &task, retry, now, &error, None)?;
        released.push(task_id);
    }
    tx.commit()?;
    Ok(released)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn enqueue(&self, task: NewTask) -> Result<TaskId, StoreError> {
        if !task.task_type.is_valid() {
            return Err(StoreError::InvalidTaskType(task.task_type.to_string()));
        }
        let parameters = serde_json::to_string(&task.parameters)?;
        let task_type = task.task_type.clone();
        let task_id = self
            .run("enqueue", move |conn, now| {
                conn.execute(
                    "INSERT INTO tasks (task_type, parameters, priority, max_retries, run_after, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        task.task_type.as_str(),
                        parameters,
                        task.priority,
                        task.max_retries,
                        task.run_after.map(|t| t.timestamp_millis()),
                        now.timestamp_millis()
                    ],
                )?;
                Ok(TaskId::new(conn.last_insert_rowid()))
            })
            .await?;
        debug!(%task_id, %task_type, "enqueued task");
        Ok(task_id)
    }

    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        strategy: ClaimStrategy,
        task_types: &[TaskType],
    ) -> Result<Option<Task>, StoreError> {
        let worker = worker_id.clone();
        let types = task_types.to_vec();
        self.run("claim_next", move |conn, now| {
            claim_next_tx(conn, now, &worker, strategy, &types)
        })
        .await
    }

    async fn start(&self, task_id: TaskId, worker_id: &WorkerId) -> Result<Task, StoreError> {
        let worker = worker_id.clone();
        self.run("start", move |conn, now| start_tx(conn, now, task_id, &worker))
            .await
    }

    async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &WorkerId,
        result: &TaskResult,
    ) -> Result<TaskStatus, StoreError> {
        let worker = worker_id.clone();
        let result = result.clone();
        let retry = self.retry.clone();
        self.run("complete", move |conn, now| {
            complete_tx(conn, now, task_id, &worker, &result, &retry)
        })
        .await
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        self.run("get", move |conn, _| fetch_task(conn, task_id)).await
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run("list", move |conn, _| {
            let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
            let mut args = Vec::new();
            if let Some(status) = status {
                sql.push_str(" WHERE status = ?1");
                args.push(SqlValue::Text(status.as_str().to_string()));
            }
            sql.push_str(&format!(
                " ORDER BY created_at DESC, id DESC LIMIT ?{}",
                args.len() + 1
            ));
            args.push(SqlValue::Integer(limit));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), TaskRow::from_row)?;
            let raw = rows.collect::<Result<Vec<_>, _>>()?;
            raw.into_iter().map(TaskRow::into_task).collect()
        })
        .await
    }

    async fn cancel(&self, task_id: TaskId) -> Result<bool, StoreError> {
        let cancelled = self
            .run("cancel", move |conn, now| cancel_tx(conn, now, task_id))
            .await?;
        if cancelled {
            info!(%task_id, "cancelled task");
        }
        Ok(cancelled)
    }

    async fn heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        let beat = heartbeat.clone();
        self.run("heartbeat", move |conn, _| {
            conn.execute(
                "INSERT INTO worker_heartbeats
                     (worker_id, last_heartbeat, tasks_processed, tasks_failed, current_task_id, strategy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (worker_id) DO UPDATE SET
                     last_heartbeat = excluded.last_heartbeat,
                     tasks_processed = excluded.tasks_processed,
                     tasks_failed = excluded.tasks_failed,
                     current_task_id = excluded.current_task_id,
                     strategy = excluded.strategy",
                params![
                    beat.worker_id.as_str(),
                    beat.last_heartbeat.timestamp_millis(),
                    to_i64(beat.tasks_processed),
                    to_i64(beat.tasks_failed),
                    beat.current_task_id.map(TaskId::get),
                    beat.strategy.as_str()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_workers(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        self.run("list_workers", |conn, _| {
            let mut stmt = conn.prepare(
                "SELECT worker_id, last_heartbeat, tasks_processed, tasks_failed, current_task_id, strategy
                 FROM worker_heartbeats ORDER BY worker_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            let raw = rows.collect::<Result<Vec<_>, _>>()?;
            raw.into_iter()
                .map(|(worker_id, last, processed, failed, current, strategy)| {
                    Ok(WorkerHeartbeat {
                        worker_id: WorkerId::new(worker_id),
                        last_heartbeat: ms_to_dt(last)?,
                        tasks_processed: to_u64(processed, "tasks_processed")?,
                        tasks_failed: to_u64(failed, "tasks_failed")?,
                        current_task_id: current.map(TaskId::new),
                        strategy: strategy
                            .parse()
                            .map_err(|err| StoreError::Corrupt(format!("heartbeat: {err}")))?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn task_log(&self, task_id: TaskId) -> Result<Vec<TaskLogEntry>, StoreError> {
        self.run("task_log", move |conn, _| {
            let mut stmt = conn.prepare(
                "SELECT id, event, worker_id, message, created_at
                 FROM task_logs WHERE task_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![task_id.get()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;
            let raw = rows.collect::<Result<Vec<_>, _>>()?;
            raw.into_iter()
                .map(|(id, event, worker_id, message, created_at)| {
                    Ok(TaskLogEntry {
                        id,
                        task_id,
                        event: event.parse().map_err(StoreError::Corrupt)?,
                        worker_id: worker_id.map(WorkerId::new),
                        message,
                        created_at: ms_to_dt(created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.run("counts", |conn, _| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = QueueCounts::default();
            for row in rows {
                let (status, n) = row?;
                let status = status
                    .parse::<TaskStatus>()
                    .map_err(|err| StoreError::Corrupt(err.to_string()))?;
                counts.add(status, usize::try_from(n).unwrap_or(0));
            }
            Ok(counts)
        })
        .await
    }

    async fn requeue_abandoned(&self, stale_after: Duration) -> Result<Vec<TaskId>, StoreError> {
        let retry = self.retry.clone();
        let released = self
            .run("requeue_abandoned", move |conn, now| {
                requeue_abandoned_tx(conn, now, stale_after, &retry)
            })
            .await?;
        if !released.is_empty() {
            warn!(count = released.len(), tasks = ?released, "released abandoned claims");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn store_with_clock() -> (SqliteTaskStore, ManualClock) {
        let clock = ManualClock::new(t0());
        let store = SqliteTaskStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()));
        (store, clock)
    }

    fn worker(name: &str) -> WorkerId {
        WorkerId::new(name)
    }

    /// Enqueue one task per priority, one second apart.
    async fn seed(store: &SqliteTaskStore, clock: &ManualClock, priorities: &[i32]) -> Vec<TaskId> {
        let mut ids = Vec::new();
        for (i, &priority) in priorities.iter().enumerate() {
            let task = NewTask::new("echo", json!({ "n": i })).with_priority(priority);
            ids.push(store.enqueue(task).await.unwrap());
            clock.advance(Duration::from_secs(1));
        }
        ids
    }

    async fn drain(store: &SqliteTaskStore, strategy: ClaimStrategy) -> Vec<TaskId> {
        let mut order = Vec::new();
        while let Some(task) = store.claim_next(&worker("w"), strategy, &[]).await.unwrap() {
            order.push(task.id);
        }
        order
    }

    #[tokio::test]
    async fn fifo_claims_oldest_first() {
        let (store, clock) = store_with_clock();
        let ids = seed(&store, &clock, &[0, 0, 0, 0, 0]).await;
        assert_eq!(drain(&store, ClaimStrategy::Fifo).await, ids);
    }

    #[tokio::test]
    async fn lifo_claims_newest_first() {
        let (store, clock) = store_with_clock();
        let mut ids = seed(&store, &clock, &[0, 0, 0, 0, 0]).await;
        ids.reverse();
        assert_eq!(drain(&store, ClaimStrategy::Lifo).await, ids);
    }

    #[tokio::test]
    async fn priority_claims_highest_first_with_fifo_tie_break() {
        let (store, clock) = store_with_clock();
        let ids = seed(&store, &clock, &[1, 5, 10, 5]).await;
        let order = drain(&store, ClaimStrategy::Priority).await;
        assert_eq!(order, vec![ids[2], ids[1], ids[3], ids[0]]);

        let mut priorities = Vec::new();
        for id in order {
            priorities.push(store.get(id).await.unwrap().unwrap().priority);
        }
        assert_eq!(priorities, vec![10, 5, 5, 1]);
    }

    #[tokio::test]
    async fn weighted_random_eventually_claims_everything() {
        let (store, clock) = store_with_clock();
        let mut ids = seed(&store, &clock, &[0, 3, 9, 1]).await;
        let mut order = drain(&store, ClaimStrategy::WeightedRandom).await;
        ids.sort();
        order.sort();
        assert_eq!(order, ids);
    }

    #[tokio::test]
    async fn claim_sets_owner_and_logs() {
        let (store, _clock) = store_with_clock();
        let id = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();

        let task = store
            .claim_next(&worker("w1"), ClaimStrategy::Fifo, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by, Some(worker("w1")));
        assert_eq!(task.claimed_at, Some(t0()));

        let log = store.task_log(id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].event, TaskEvent::Claimed);
        assert_eq!(log[0].worker_id, Some(worker("w1")));
    }

    #[tokio::test]
    async fn future_run_after_is_invisible() {
        let (store, clock) = store_with_clock();
        let later = t0() + chrono::Duration::minutes(10);
        let id = store
            .enqueue(NewTask::new("echo", json!({})).run_after(later))
            .await
            .unwrap();

        assert!(store.claim_next(&worker("w"), ClaimStrategy::Fifo, &[]).await.unwrap().is_none());
        clock.advance(Duration::from_secs(600));
        let task = store
            .claim_next(&worker("w"), ClaimStrategy::Fifo, &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);
    }

    #[tokio::test]
    async fn type_filter_limits_claims() {
        let (store, _clock) = store_with_clock();
        store.enqueue(NewTask::new("reddit.scrape", json!({}))).await.unwrap();
        let llm = store.enqueue(NewTask::new("llm.title", json!({}))).await.unwrap();

        let task = store
            .claim_next(&worker("w"), ClaimStrategy::Fifo, &[TaskType::new("llm.title")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, llm);
        assert!(store
            .claim_next(&worker("w"), ClaimStrategy::Fifo, &[TaskType::new("llm.title")])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn complete_success_stores_result() {
        let (store, _clock) = store_with_clock();
        let id = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store.claim_next(&worker("w"), ClaimStrategy::Fifo, &[]).await.unwrap();
        store.start(id, &worker("w")).await.unwrap();

        let status = store
            .complete(id, &worker("w"), &TaskResult::success(2).with_data(json!({"ok": true})))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result_data, Some(json!({"ok": true})));
        assert_eq!(task.completed_at, Some(t0()));

        let events: Vec<_> = store.task_log(id).await.unwrap().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec![TaskEvent::Claimed, TaskEvent::Started, TaskEvent::Completed]);
    }

    #[tokio::test]
    async fn retry_bound_is_enforced() {
        let (store, _clock) = store_with_clock();
        let id = store
            .enqueue(NewTask::new("flaky", json!({})).with_max_retries(2))
            .await
            .unwrap();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let task = store
                .claim_next(&worker("w"), ClaimStrategy::Fifo, &[])
                .await
                .unwrap()
                .expect("task should be claimable");
            assert_eq!(task.id, id);
            statuses.push(
                store
                    .complete(id, &worker("w"), &TaskResult::failure("boom"))
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(
            statuses,
            vec![TaskStatus::Queued, TaskStatus::Queued, TaskStatus::Failed]
        );

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error_message.as_deref(), Some("boom"));
        assert!(store.claim_next(&worker("w"), ClaimStrategy::Fifo, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_retry_waits_for_run_after() {
        let clock = ManualClock::new(t0());
        let store = SqliteTaskStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
            .with_retry_policy(RetryPolicy::exponential(
                Duration::from_secs(30),
                2.0,
                Duration::from_secs(300),
            ));
        let id = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store.claim_next(&worker("w"), ClaimStrategy::Fifo, &[]).await.unwrap();
        store.complete(id, &worker("w"), &TaskResult::failure("later")).await.unwrap();

        assert!(store.claim_next(&worker("w"), ClaimStrategy::Fifo, &[]).await.unwrap().is_none());
        clock.advance(Duration::from_secs(30));
        assert!(store.claim_next(&worker("w"), ClaimStrategy::Fifo, &[]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ownership_mismatch_leaves_task_untouched() {
        let (store, _clock) = store_with_clock();
        let id = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store.claim_next(&worker("owner"), ClaimStrategy::Fifo, &[]).await.unwrap();
        let before = store.get(id).await.unwrap().unwrap();

        let err = store
            .complete(id, &worker("intruder"), &TaskResult::success(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Ownership { .. }));
        assert_eq!(store.get(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn completed_task_rereads_identically() {
        let (store, clock) = store_with_clock();
        let id = store.enqueue(NewTask::new("echo", json!({"a": 1}))).await.unwrap();
        store.claim_next(&worker("w"), ClaimStrategy::Fifo, &[]).await.unwrap();
        store.complete(id, &worker("w"), &TaskResult::success(1)).await.unwrap();

        let first = store.get(id).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(3600));
        store.requeue_abandoned(Duration::from_secs(1)).await.unwrap();
        assert!(!store.cancel(id).await.unwrap());
        for _ in 0..3 {
            assert_eq!(store.get(id).await.unwrap().unwrap(), first);
        }

        let err = store
            .complete(id, &worker("w"), &TaskResult::failure("again"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.get(id).await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn cancel_only_before_execution() {
        let (store, _clock) = store_with_clock();
        let queued = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        assert!(store.cancel(queued).await.unwrap());
        assert_eq!(store.get(queued).await.unwrap().unwrap().status, TaskStatus::Cancelled);

        let claimed = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store.claim_next(&worker("w"), ClaimStrategy::Fifo, &[]).await.unwrap();
        assert!(store.cancel(claimed).await.unwrap());
        let err = store.start(claimed, &worker("w")).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: TaskStatus::Cancelled, .. }
        ));

        let running = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store.claim_next(&worker("w"), ClaimStrategy::Fifo, &[]).await.unwrap();
        store.start(running, &worker("w")).await.unwrap();
        assert!(!store.cancel(running).await.unwrap());
        assert!(!store.cancel(TaskId::new(9_999)).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_task_type_is_rejected_on_enqueue() {
        let (store, _clock) = store_with_clock();
        let err = store
            .enqueue(NewTask::new("not valid", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTaskType(_)));
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let (store, clock) = store_with_clock();
        let ids = seed(&store, &clock, &[0, 0, 0]).await;
        store.cancel(ids[1]).await.unwrap();

        let all: Vec<_> = store.list(None, 10).await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(all, vec![ids[2], ids[1], ids[0]]);

        let queued: Vec<_> = store
            .list(Some(TaskStatus::Queued), 1)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(queued, vec![ids[2]]);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.cancelled, 1);
    }

    #[tokio::test]
    async fn heartbeat_upserts_single_row() {
        let (store, clock) = store_with_clock();
        let mut beat = WorkerHeartbeat {
            worker_id: worker("w1"),
            last_heartbeat: clock.now(),
            tasks_processed: 0,
            tasks_failed: 0,
            current_task_id: None,
            strategy: ClaimStrategy::Priority,
        };
        store.heartbeat(&beat).await.unwrap();

        clock.advance(Duration::from_secs(5));
        beat.last_heartbeat = clock.now();
        beat.tasks_processed = 4;
        beat.tasks_failed = 1;
        beat.current_task_id = Some(TaskId::new(3));
        store.heartbeat(&beat).await.unwrap();

        let workers = store.list_workers().await.unwrap();
        assert_eq!(workers, vec![beat]);
    }

    #[tokio::test]
    async fn abandoned_claims_are_requeued() {
        let (store, clock) = store_with_clock();
        let dead = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        let alive = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store.claim_next(&worker("dead"), ClaimStrategy::Fifo, &[]).await.unwrap();
        store.claim_next(&worker("alive"), ClaimStrategy::Fifo, &[]).await.unwrap();

        clock.advance(Duration::from_secs(600));
        store
            .heartbeat(&WorkerHeartbeat {
                worker_id: worker("alive"),
                last_heartbeat: clock.now(),
                tasks_processed: 0,
                tasks_failed: 0,
                current_task_id: Some(alive),
                strategy: ClaimStrategy::Fifo,
            })
            .await
            .unwrap();

        let released = store.requeue_abandoned(Duration::from_secs(300)).await.unwrap();
        assert_eq!(released, vec![dead]);

        let task = store.get(dead).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.claimed_by, None);
        assert!(task.error_message.unwrap().contains("dead"));
        assert_eq!(store.get(alive).await.unwrap().unwrap().status, TaskStatus::Claimed);

        // the old owner lost its claim
        let err = store
            .complete(dead, &worker("dead"), &TaskResult::success(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Ownership { claimed_by: None, .. }));
    }

    #[tokio::test]
    async fn reopening_a_file_keeps_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let id = {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.enqueue(NewTask::new("echo", json!({"keep": true}))).await.unwrap()
        };
        let store = SqliteTaskStore::open(&path).unwrap();
        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.parameters, json!({"keep": true}));
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn mark_claimed_only_moves_queued_rows() {
        let (store, _clock) = store_with_clock();
        let id = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store.claim_next(&worker("a"), ClaimStrategy::Fifo, &[]).await.unwrap();

        let mut conn = store.conn.lock().unwrap();
        let tx = conn.transaction().unwrap();
        assert!(!mark_claimed(&tx, id, &worker("b"), 0).unwrap());
        let task = fetch_task(&tx, id).unwrap().unwrap();
        assert_eq!(task.claimed_by, Some(worker("a")));
    }

    #[tokio::test]
    async fn out_of_range_timestamp_is_corrupt() {
        let (store, _clock) = store_with_clock();
        let id = store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE tasks SET created_at = ?2 WHERE id = ?1",
                params![id.get(), i64::MAX],
            )
            .unwrap();

        let err = store.get(id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(msg) if msg.contains("timestamp")));
        assert!(ms_to_dt(t0().timestamp_millis()).is_ok());
    }
}
