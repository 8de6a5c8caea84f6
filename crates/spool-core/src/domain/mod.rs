//! Domain model (IDs, tasks, results, heartbeats, audit log).

pub mod heartbeat;
pub mod ids;
pub mod log;
pub mod outcome;
pub mod task;

pub use heartbeat::WorkerHeartbeat;
pub use ids::{TaskId, WorkerId};
pub use log::{TaskEvent, TaskLogEntry};
pub use outcome::TaskResult;
pub use task::{DEFAULT_MAX_RETRIES, NewTask, Task, TaskType};
