//! Ports - abstraction layer.
//!
//! Each trait is the seam to something outside the worker's own logic: the
//! task database, the wall clock, the remote coordination service.

pub mod clock;
pub mod reporter;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::reporter::{CompletionReport, ExternalReporter, NoopReporter};
pub use self::task_store::TaskStore;
