//! spool-core
//!
//! A persisted task queue with competing workers. Producers enqueue typed
//! JSON tasks into a shared SQLite file; any number of worker processes
//! claim them one at a time under a pluggable ordering strategy, run the
//! handler registered for the task type, record the result, and optionally
//! report completion to a remote coordination service.
//!
//! # Modules
//! - **domain**: ids, tasks, results, heartbeats, audit log entries
//! - **queue**: status machine, claiming strategies, retry policy,
//!   `SqliteTaskStore` and `InMemoryTaskStore`
//! - **ports**: `TaskStore`, `ExternalReporter`, `Clock`
//! - **app**: handler registry, poller, worker, builder, reaper
//! - **impls**: HTTP reporter
//! - **config**: YAML file + environment overrides
//! - **observability**: queue counts and worker liveness views
//!
//! # Example
//! ```ignore
//! let store = Arc::new(SqliteTaskStore::open("spool.db")?);
//! store.enqueue(NewTask::new("echo", json!({"msg": "hi"}))).await?;
//!
//! let worker = WorkerBuilder::new(store)
//!     .strategy(ClaimStrategy::Priority)
//!     .handler("echo", handler_fn(|task: Task| async move {
//!         Ok::<_, HandlerError>(TaskResult::success(1).with_data(task.parameters))
//!     }))?
//!     .build()?;
//! worker.run(None).await;
//! ```

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
