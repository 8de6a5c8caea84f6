//! App - application layer.
//!
//! Combines the ports into the running pieces of a worker process.
//!
//! # Components
//! - **WorkerBuilder**: wiring and fail-fast validation
//! - **HandlerRegistry**: `task_type -> TaskHandler`
//! - **TaskPoller**: claim loop with idle backoff
//! - **Worker**: poller + handlers + reporter + heartbeat
//! - **Reaper**: releases claims of workers that went silent

pub mod builder;
pub mod poller;
pub mod reaper;
pub mod registry;
pub mod worker;

pub use self::builder::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REPORTER_TIMEOUT, WorkerBuilder};
pub use self::poller::{
    Backoff, PollCallbacks, PollOutcome, PollerConfig, PollerState, PollerStats, TaskPoller,
};
pub use self::reaper::Reaper;
pub use self::registry::{FnHandler, HandlerRegistry, TaskHandler, handler_fn};
pub use self::worker::{StopHandle, Worker, WorkerStats};
