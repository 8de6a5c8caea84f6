//! Impls - adapters for ports that talk to the outside world.
//!
//! # Included
//! - **HttpReporter**: `ExternalReporter` over REST (reqwest)
//!
//! Store implementations live in `queue` next to the status machine they
//! enforce.

pub mod http_reporter;

pub use self::http_reporter::{HttpReporter, ReporterConfig, init_reporter};
