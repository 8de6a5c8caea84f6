//! WorkerBuilder - wiring and startup validation for a [`Worker`].
//!
//! Fail-fast: anything that would make the worker useless (no handlers,
//! an expected task type nobody registered, a malformed or duplicate type)
//! is reported by `handler()` / `build()` instead of at the first claim.

use std::sync::Arc;
use std::time::Duration;

use super::poller::PollerConfig;
use super::registry::{HandlerRegistry, TaskHandler};
use super::worker::{StopHandle, Worker, WorkerCore};
use crate::domain::{TaskType, WorkerId};
use crate::error::{RegistryError, WorkerError};
use crate::ports::{Clock, ExternalReporter, NoopReporter, SystemClock, TaskStore};
use crate::queue::ClaimStrategy;

pub const DEFAULT_REPORTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat period while a handler runs. Keep it well under the reaper's
/// stale threshold.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// ```ignore
/// let worker = WorkerBuilder::new(store)
///     .strategy(ClaimStrategy::Priority)
///     .handler("youtube.scrape", Arc::new(ScrapeHandler::new(client)))?
///     .expect_task_types(&["youtube.scrape"])
///     .reporter(init_reporter(config.reporter_config().as_ref()).await)
///     .build()?;
/// ```
pub struct WorkerBuilder {
    store: Arc<dyn TaskStore>,
    worker_id: Option<WorkerId>,
    strategy: ClaimStrategy,
    registry: HandlerRegistry,
    expected_types: Option<Vec<String>>,
    poller_config: PollerConfig,
    reporter: Arc<dyn ExternalReporter>,
    reporter_timeout: Duration,
    heartbeat_interval: Duration,
    clock: Arc<dyn Clock>,
    stop: StopHandle,
}

impl WorkerBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            worker_id: None,
            strategy: ClaimStrategy::default(),
            registry: HandlerRegistry::new(),
            expected_types: None,
            poller_config: PollerConfig::default(),
            reporter: Arc::new(NoopReporter),
            reporter_timeout: DEFAULT_REPORTER_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            clock: Arc::new(SystemClock),
            stop: StopHandle::new(),
        }
    }

    /// Defaults to a generated `worker-<ulid>`.
    pub fn worker_id(mut self, worker_id: WorkerId) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn strategy(mut self, strategy: ClaimStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn handler(
        mut self,
        task_type: impl Into<TaskType>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(task_type.into(), handler)?;
        Ok(self)
    }

    /// Task types that must have a handler by the time `build()` runs.
    pub fn expect_task_types(mut self, task_types: &[&str]) -> Self {
        self.expected_types = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn poller_config(mut self, config: PollerConfig) -> Self {
        self.poller_config = config;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn ExternalReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn reporter_timeout(mut self, timeout: Duration) -> Self {
        self.reporter_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a stop signal with other workers (or a reaper).
    pub fn stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn build(self) -> Result<Worker, WorkerError> {
        if self.registry.is_empty() {
            return Err(WorkerError::NoHandlers);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(WorkerError::ZeroHeartbeatInterval);
        }
        if let Some(expected) = &self.expected_types {
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| self.registry.get(&TaskType::new(t.as_str())).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(RegistryError::MissingTaskTypes(missing).into());
            }
        }

        let core = WorkerCore::new(
            self.worker_id.unwrap_or_else(WorkerId::generate),
            self.strategy,
            self.store,
            Arc::new(self.registry),
            self.reporter,
            self.reporter_timeout,
            self.heartbeat_interval,
            self.clock,
        );
        Ok(Worker::new(core, self.poller_config, self.stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::handler_fn;
    use crate::domain::{Task, TaskResult};
    use crate::error::HandlerError;
    use crate::queue::InMemoryTaskStore;

    fn ok_handler() -> Arc<dyn TaskHandler> {
        handler_fn(|_task: Task| async { Ok::<_, HandlerError>(TaskResult::success(0)) })
    }

    fn builder() -> WorkerBuilder {
        WorkerBuilder::new(Arc::new(InMemoryTaskStore::new()))
    }

    #[test]
    fn build_success() {
        let worker = builder()
            .handler("a", ok_handler())
            .unwrap()
            .expect_task_types(&["a"])
            .strategy(ClaimStrategy::Lifo)
            .build()
            .unwrap();
        assert_eq!(worker.strategy(), ClaimStrategy::Lifo);
        assert!(worker.worker_id().as_str().starts_with("worker-"));
    }

    #[test]
    fn build_missing_task_types() {
        let result = builder()
            .handler("a", ok_handler())
            .unwrap()
            .expect_task_types(&["a", "b"])
            .build();
        assert!(matches!(
            result,
            Err(WorkerError::Registry(RegistryError::MissingTaskTypes(missing))) if missing == vec!["b".to_string()]
        ));
    }

    #[test]
    fn build_without_handlers_fails() {
        assert!(matches!(builder().build(), Err(WorkerError::NoHandlers)));
    }

    #[test]
    fn zero_heartbeat_interval_is_rejected() {
        let result = builder()
            .handler("a", ok_handler())
            .unwrap()
            .heartbeat_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(WorkerError::ZeroHeartbeatInterval)));
    }

    #[test]
    fn duplicate_handler_fails_at_registration() {
        let result = builder()
            .handler("a", ok_handler())
            .unwrap()
            .handler("a", ok_handler());
        assert!(matches!(result, Err(RegistryError::DuplicateHandler(_))));
    }

    #[test]
    fn shared_stop_handle_reaches_worker() {
        let stop = StopHandle::new();
        let worker = builder()
            .handler("a", ok_handler())
            .unwrap()
            .stop_handle(stop.clone())
            .build()
            .unwrap();
        stop.stop();
        assert!(worker.stop_handle().is_stopped());
    }
}
