//! Queue module: status machine, claiming strategies, retry logic, and the
//! two `TaskStore` implementations.

mod memory;
mod retry;
mod schema;
mod sqlite;
mod state;
mod strategy;

pub use memory::InMemoryTaskStore;
pub use retry::{BusyPolicy, FailureDisposition, RetryPolicy};
pub use sqlite::SqliteTaskStore;
pub use state::{TaskStatus, UnknownStatus};
pub use strategy::{Candidate, ClaimStrategy, UnknownStrategy};
