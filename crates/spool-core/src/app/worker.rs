//! Worker - binds handlers, the poller and the reporter into a runnable unit.
//!
//! # Flow per claimed task
//! 1. `TaskStore::start()` (claimed -> running); a task cancelled since the
//!    claim is skipped here.
//! 2. Handler lookup and execution (errors become a failed `TaskResult`),
//!    heartbeating every `heartbeat_interval` so the reaper sees a live owner.
//! 3. `TaskStore::complete()`; the store decides requeue vs. failed. Busy
//!    is retried until the result lands, even after a stop request.
//! 4. Best-effort `ExternalReporter::report_completion()`.
//! 5. Heartbeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::poller::{PollCallbacks, PollerConfig, PollerStats, TaskPoller};
use super::registry::HandlerRegistry;
use crate::domain::{Task, TaskId, TaskResult, WorkerHeartbeat, WorkerId};
use crate::error::{ReporterError, StoreError};
use crate::ports::{Clock, CompletionReport, ExternalReporter, TaskStore};
use crate::queue::{ClaimStrategy, TaskStatus};

const RECORD_RETRY_BASE: Duration = Duration::from_millis(100);
const RECORD_RETRY_MAX: Duration = Duration::from_secs(5);

/// Cloneable stop signal.
///
/// `stop()` is synchronous and never blocks, so it can be called from a
/// signal-handling task. Workers finish the task in hand (including its
/// `complete()` call) before exiting.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub poller: PollerStats,
    /// Results recorded in the store, successful or not.
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    /// Claimed but not executed (cancelled or reaped in between).
    pub tasks_skipped: u64,
    pub reports_failed: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    reports_failed: AtomicU64,
}

/// Everything the poller callbacks need; shared with the spawned handler
/// tasks.
pub(crate) struct WorkerCore {
    pub(crate) worker_id: WorkerId,
    pub(crate) strategy: ClaimStrategy,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) reporter: Arc<dyn ExternalReporter>,
    pub(crate) reporter_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) clock: Arc<dyn Clock>,
    counters: Counters,
}

impl WorkerCore {
    pub(crate) fn new(
        worker_id: WorkerId,
        strategy: ClaimStrategy,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        reporter: Arc<dyn ExternalReporter>,
        reporter_timeout: Duration,
        heartbeat_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            worker_id,
            strategy,
            store,
            registry,
            reporter,
            reporter_timeout,
            heartbeat_interval,
            clock,
            counters: Counters::default(),
        }
    }

    async fn heartbeat(&self, current_task_id: Option<TaskId>) {
        let beat = WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            last_heartbeat: self.clock.now(),
            tasks_processed: self.counters.processed.load(Ordering::Relaxed),
            tasks_failed: self.counters.failed.load(Ordering::Relaxed),
            current_task_id,
            strategy: self.strategy,
        };
        if let Err(err) = self.store.heartbeat(&beat).await {
            warn!(worker_id = %self.worker_id, error = %err, "heartbeat failed");
        }
    }

    async fn run_handler(&self, task: &Task) -> TaskResult {
        let Some(handler) = self.registry.get(&task.task_type) else {
            return TaskResult::failure(format!("no handler registered for {}", task.task_type));
        };
        match handler.process(task).await {
            Ok(result) => result,
            Err(err) => {
                debug!(worker_id = %self.worker_id, task_id = %task.id, error = %err, "handler returned error");
                err.into()
            }
        }
    }

    /// Handler execution with a heartbeat every `heartbeat_interval`. Runs
    /// on the poller's handler task; no extra task is spawned.
    async fn run_with_heartbeats(&self, task: &Task) -> TaskResult {
        let handler = self.run_handler(task);
        tokio::pin!(handler);
        let period = self.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut handler => return result,
                _ = ticker.tick() => self.heartbeat(Some(task.id)).await,
            }
        }
    }

    /// `complete()` until it succeeds or fails for a reason other than lock
    /// contention. A stop request does not end the retries.
    async fn record(&self, task: &Task, result: &TaskResult) -> Option<TaskStatus> {
        let mut delay = RECORD_RETRY_BASE;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.store.complete(task.id, &self.worker_id, result).await {
                Ok(status) => return Some(status),
                Err(err) if err.is_busy() => {
                    warn!(
                        worker_id = %self.worker_id,
                        task_id = %task.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "store busy while recording result, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECORD_RETRY_MAX);
                }
                Err(err @ StoreError::Ownership { .. }) => {
                    warn!(worker_id = %self.worker_id, task_id = %task.id, error = %err, "claim lost, result dropped");
                    return None;
                }
                Err(err) => {
                    warn!(worker_id = %self.worker_id, task_id = %task.id, error = %err, "failed to record result");
                    return None;
                }
            }
        }
    }

    async fn report_result(&self, task: &Task, result: TaskResult) -> Option<TaskStatus> {
        let status = self.record(task, &result).await?;

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        if !result.success {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            worker_id = %self.worker_id,
            task_id = %task.id,
            task_type = %task.task_type,
            success = result.success,
            %status,
            "task finished"
        );

        let report = CompletionReport {
            task_id: task.id,
            worker_id: self.worker_id.clone(),
            task_type: task.task_type.clone(),
            success: result.success,
            status,
            items_processed: result.items_processed,
            error: result.error_message(),
            result: result.data,
            completed_at: self.clock.now(),
        };
        if let Err(err) = self.notify(&report).await {
            self.counters.reports_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker_id = %self.worker_id,
                task_id = %task.id,
                reporter = self.reporter.name(),
                error = %err,
                "external report failed"
            );
        }
        Some(status)
    }

    async fn notify(&self, report: &CompletionReport) -> Result<(), ReporterError> {
        tokio::time::timeout(self.reporter_timeout, self.reporter.report_completion(report))
            .await
            .map_err(|_| ReporterError::Timeout(self.reporter_timeout))?
    }

    fn stats(&self, poller: PollerStats) -> WorkerStats {
        WorkerStats {
            poller,
            tasks_processed: self.counters.processed.load(Ordering::Relaxed),
            tasks_failed: self.counters.failed.load(Ordering::Relaxed),
            tasks_skipped: self.counters.skipped.load(Ordering::Relaxed),
            reports_failed: self.counters.reports_failed.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl PollCallbacks for WorkerCore {
    async fn on_task(&self, task: Task) -> Option<TaskResult> {
        let task = match self.store.start(task.id, &self.worker_id).await {
            Ok(task) => task,
            Err(err) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                info!(worker_id = %self.worker_id, task_id = %task.id, error = %err, "skipping claimed task");
                return None;
            }
        };
        self.heartbeat(Some(task.id)).await;
        debug!(worker_id = %self.worker_id, task_id = %task.id, task_type = %task.task_type, "running task");
        Some(self.run_with_heartbeats(&task).await)
    }

    async fn on_result(&self, task: Task, result: TaskResult) {
        self.report_result(&task, result).await;
        self.heartbeat(None).await;
    }

    async fn on_idle(&self) {
        self.heartbeat(None).await;
    }
}

/// A runnable worker. Build one with [`WorkerBuilder`](super::WorkerBuilder).
pub struct Worker {
    core: Arc<WorkerCore>,
    poller_config: PollerConfig,
    stop: StopHandle,
}

impl Worker {
    pub(crate) fn new(core: WorkerCore, poller_config: PollerConfig, stop: StopHandle) -> Self {
        Self {
            core: Arc::new(core),
            poller_config,
            stop,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.core.worker_id
    }

    pub fn strategy(&self) -> ClaimStrategy {
        self.core.strategy
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Graceful: the task in hand is finished first.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Drive the poller until stopped or `max_iterations` ticks have run.
    /// Production workers pass `None`.
    pub async fn run(&self, max_iterations: Option<u64>) -> WorkerStats {
        let core = &self.core;
        info!(
            worker_id = %core.worker_id,
            strategy = %core.strategy,
            task_types = ?core.registry.task_types(),
            reporter = core.reporter.name(),
            "worker starting"
        );
        core.heartbeat(None).await;

        let mut poller = TaskPoller::new(
            Arc::clone(&core.store),
            core.worker_id.clone(),
            core.strategy,
            core.registry.task_types(),
            Arc::clone(&self.core) as Arc<dyn PollCallbacks>,
            self.poller_config.clone(),
            self.stop.subscribe(),
        );
        let poller_stats = poller.run(max_iterations).await;

        core.heartbeat(None).await;
        let stats = core.stats(poller_stats);
        info!(
            worker_id = %core.worker_id,
            processed = stats.tasks_processed,
            failed = stats.tasks_failed,
            "worker stopped"
        );
        stats
    }

    /// Record a result for a task this worker holds and notify the
    /// reporter. Returns the stored status, or `None` when the store
    /// refused the result (logged).
    pub async fn report_result(&self, task: &Task, result: TaskResult) -> Option<TaskStatus> {
        self.core.report_result(task, result).await
    }

    /// Upsert this worker's heartbeat row.
    pub async fn heartbeat(&self) {
        self.core.heartbeat(None).await;
    }
}
