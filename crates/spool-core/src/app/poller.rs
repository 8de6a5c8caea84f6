//! TaskPoller - claim loop for one worker.
//!
//! # States
//! `Idle ⇄ Claiming → Executing → Reporting → Idle`, terminal `Stopped`.
//!
//! # Per tick
//! 1. `claim_next`. A claim resets the backoff and runs the callbacks; the
//!    next tick follows without sleeping.
//! 2. Nothing claimable (or the store was busy, or failed): `on_idle`, then
//!    sleep the current backoff and grow it towards `max_backoff`.
//!
//! Handler panics are caught here and turned into a failed `TaskResult`;
//! a handler bug never ends the loop.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::domain::{Task, TaskId, TaskResult, TaskType, WorkerId};
use crate::ports::TaskStore;
use crate::queue::ClaimStrategy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Sleep after the first empty poll, and the value backoff resets to.
    pub poll_interval: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Idle backoff: `poll_interval`, then `* multiplier` per empty poll,
/// capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: PollerConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: PollerConfig) -> Self {
        let current = config.poll_interval;
        Self { config, current }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.config.poll_interval;
    }

    pub fn grow(&mut self) {
        let cap = self.config.max_backoff.max(self.config.poll_interval);
        let multiplier = self.config.backoff_multiplier.max(1.0);
        let next = self.current.as_secs_f64() * multiplier;
        self.current = if !next.is_finite() || next >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(next)
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Claiming,
    Executing,
    Reporting,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerStats {
    pub polls: u64,
    pub claims: u64,
    pub empty_polls: u64,
    /// Polls where the store stayed locked; not errors.
    pub busy_polls: u64,
    pub store_errors: u64,
    pub handler_panics: u64,
}

/// Result of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Claimed, executed and handed to `on_result`.
    Processed(TaskId),
    /// Claimed, but `on_task` declined to run it (e.g. cancelled meanwhile).
    Skipped(TaskId),
    Empty,
    Busy,
    StoreError,
}

impl PollOutcome {
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            PollOutcome::Empty | PollOutcome::Busy | PollOutcome::StoreError
        )
    }
}

/// What the poller calls back into. Implemented by the worker.
#[async_trait]
pub trait PollCallbacks: Send + Sync + 'static {
    /// Execute a claimed task. `None` skips it without recording a result.
    /// Runs on its own tokio task so a panic is contained.
    async fn on_task(&self, task: Task) -> Option<TaskResult>;

    /// Record the result; must have called `complete()` before returning.
    async fn on_result(&self, task: Task, result: TaskResult);

    /// Nothing was claimed this tick.
    async fn on_idle(&self);
}

pub struct TaskPoller {
    store: Arc<dyn TaskStore>,
    worker_id: WorkerId,
    strategy: ClaimStrategy,
    task_types: Vec<TaskType>,
    callbacks: Arc<dyn PollCallbacks>,
    backoff: Backoff,
    state: PollerState,
    stats: PollerStats,
    stop: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        store: Arc<dyn TaskStore>,
        worker_id: WorkerId,
        strategy: ClaimStrategy,
        task_types: Vec<TaskType>,
        callbacks: Arc<dyn PollCallbacks>,
        config: PollerConfig,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            worker_id,
            strategy,
            task_types,
            callbacks,
            backoff: Backoff::new(config),
            state: PollerState::Idle,
            stats: PollerStats::default(),
            stop,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    fn set_state(&mut self, state: PollerState) {
        if self.state != state {
            trace!(worker_id = %self.worker_id, from = ?self.state, to = ?state, "poller state");
            self.state = state;
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// One tick without the idle sleep.
    pub async fn poll_once(&mut self) -> PollOutcome {
        self.stats.polls += 1;
        self.set_state(PollerState::Claiming);

        let claimed = self
            .store
            .claim_next(&self.worker_id, self.strategy, &self.task_types)
            .await;
        let outcome = match claimed {
            Ok(Some(task)) => {
                self.stats.claims += 1;
                self.backoff.reset();
                self.execute(task).await
            }
            Ok(None) => {
                self.stats.empty_polls += 1;
                PollOutcome::Empty
            }
            Err(err) if err.is_busy() => {
                self.stats.busy_polls += 1;
                debug!(worker_id = %self.worker_id, error = %err, "store busy, treating as empty poll");
                PollOutcome::Busy
            }
            Err(err) => {
                self.stats.store_errors += 1;
                error!(worker_id = %self.worker_id, error = %err, "claim failed");
                PollOutcome::StoreError
            }
        };

        self.set_state(PollerState::Idle);
        if outcome.is_idle() {
            self.callbacks.on_idle().await;
        }
        outcome
    }

    async fn execute(&mut self, task: Task) -> PollOutcome {
        let task_id = task.id;
        self.set_state(PollerState::Executing);

        let callbacks = Arc::clone(&self.callbacks);
        let claimed = task.clone();
        let result = match tokio::spawn(async move { callbacks.on_task(claimed).await }).await {
            Ok(Some(result)) => result,
            Ok(None) => return PollOutcome::Skipped(task_id),
            Err(err) if err.is_panic() => {
                self.stats.handler_panics += 1;
                let message = panic_message(err.into_panic());
                error!(
                    worker_id = %self.worker_id,
                    %task_id,
                    task_type = %task.task_type,
                    panic = %message,
                    "handler panicked"
                );
                TaskResult::failure(format!("handler panicked: {message}"))
            }
            Err(err) => {
                warn!(worker_id = %self.worker_id, %task_id, error = %err, "handler task cancelled");
                TaskResult::failure(format!("handler task cancelled: {err}"))
            }
        };

        self.set_state(PollerState::Reporting);
        self.callbacks.on_result(task, result).await;
        PollOutcome::Processed(task_id)
    }

    /// Poll until stopped or `max_iterations` ticks have run.
    pub async fn run(&mut self, max_iterations: Option<u64>) -> PollerStats {
        let cap_reached = |n: u64| max_iterations.is_some_and(|max| n >= max);
        let mut iterations = 0u64;

        while !self.is_stopped() && !cap_reached(iterations) {
            iterations += 1;
            let outcome = self.poll_once().await;
            if !outcome.is_idle() || cap_reached(iterations) {
                continue;
            }

            let delay = self.backoff.current();
            trace!(worker_id = %self.worker_id, delay_ms = delay.as_millis() as u64, "idle backoff");
            if self.sleep_or_stop(delay).await {
                break;
            }
            self.backoff.grow();
        }

        self.set_state(PollerState::Stopped);
        self.stats.clone()
    }

    /// Returns true when woken by a stop request.
    async fn sleep_or_stop(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.stop.wait_for(|stopped| *stopped) => true,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use crate::queue::InMemoryTaskStore;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder {
        idles: Mutex<Vec<Instant>>,
        results: Mutex<Vec<(TaskId, TaskResult)>>,
    }

    #[async_trait]
    impl PollCallbacks for Recorder {
        async fn on_task(&self, task: Task) -> Option<TaskResult> {
            if task.parameters["panic"] == json!(true) {
                panic!("boom");
            }
            if task.parameters["skip"] == json!(true) {
                return None;
            }
            Some(TaskResult::success(1))
        }

        async fn on_result(&self, task: Task, result: TaskResult) {
            self.results.lock().unwrap().push((task.id, result));
        }

        async fn on_idle(&self) {
            self.idles.lock().unwrap().push(Instant::now());
        }
    }

    fn poller(store: Arc<InMemoryTaskStore>, recorder: Arc<Recorder>) -> (TaskPoller, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let poller = TaskPoller::new(
            store,
            WorkerId::new("w"),
            ClaimStrategy::Fifo,
            Vec::new(),
            recorder,
            PollerConfig::default(),
            rx,
        );
        (poller, tx)
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(PollerConfig::default());
        let mut seen = vec![backoff.current()];
        for _ in 0..8 {
            backoff.grow();
            seen.push(backoff.current());
        }
        assert_eq!(seen[0], Duration::from_secs(5));
        assert_eq!(seen[1], Duration::from_millis(7_500));
        assert_eq!(seen[2], Duration::from_millis(11_250));
        assert_eq!(seen[3], Duration::from_millis(16_875));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), Duration::from_secs(60));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_polls_sleep_with_growing_backoff() {
        let store = Arc::new(InMemoryTaskStore::new());
        let recorder = Arc::new(Recorder::default());
        let (mut poller, _tx) = poller(store, Arc::clone(&recorder));

        let stats = poller.run(Some(4)).await;
        assert_eq!(stats.polls, 4);
        assert_eq!(stats.empty_polls, 4);
        assert_eq!(poller.state(), PollerState::Stopped);

        let idles = recorder.idles.lock().unwrap().clone();
        let gaps: Vec<Duration> = idles.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(5),
                Duration::from_millis(7_500),
                Duration::from_millis(11_250),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn claim_resets_backoff() {
        let store = Arc::new(InMemoryTaskStore::new());
        let recorder = Arc::new(Recorder::default());
        let (mut poller, _tx) = poller(Arc::clone(&store), Arc::clone(&recorder));

        poller.run(Some(3)).await;
        assert_eq!(poller.backoff().current(), Duration::from_millis(11_250));

        store.enqueue(NewTask::new("echo", json!({}))).await.unwrap();
        assert!(matches!(poller.poll_once().await, PollOutcome::Processed(_)));
        assert_eq!(poller.backoff().current(), Duration::from_secs(5));
        assert_eq!(recorder.results.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handler_panic_becomes_failed_result() {
        let store = Arc::new(InMemoryTaskStore::new());
        let recorder = Arc::new(Recorder::default());
        let (mut poller, _tx) = poller(Arc::clone(&store), Arc::clone(&recorder));

        let id = store
            .enqueue(NewTask::new("echo", json!({"panic": true})))
            .await
            .unwrap();
        assert_eq!(poller.poll_once().await, PollOutcome::Processed(id));
        assert_eq!(poller.stats().handler_panics, 1);

        let results = recorder.results.lock().unwrap();
        let (_, result) = &results[0];
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn skipped_task_is_not_reported() {
        let store = Arc::new(InMemoryTaskStore::new());
        let recorder = Arc::new(Recorder::default());
        let (mut poller, _tx) = poller(Arc::clone(&store), Arc::clone(&recorder));

        let id = store
            .enqueue(NewTask::new("echo", json!({"skip": true})))
            .await
            .unwrap();
        assert_eq!(poller.poll_once().await, PollOutcome::Skipped(id));
        assert!(recorder.results.lock().unwrap().is_empty());
        assert!(recorder.idles.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_idle_sleep() {
        let store = Arc::new(InMemoryTaskStore::new());
        let recorder = Arc::new(Recorder::default());
        let (mut poller, tx) = poller(store, recorder);

        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let stats = poller.run(None).await;
            (stats, poller.state())
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send_replace(true);

        let (stats, state) = handle.await.unwrap();
        assert_eq!(state, PollerState::Stopped);
        assert_eq!(stats.polls, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
