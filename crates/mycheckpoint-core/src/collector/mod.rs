//! Sampling of the monitored server and the local host.
//!
//! - `traits`: `StatusSource` and `FileSystem` seams
//! - `mysql`: `MysqlSource`, the live implementation (feature `mysql`)
//! - `procfs`: OS metrics from `/proc` and mounted filesystems
//! - `collector`: merges everything into one normalized value map
//! - `mock`: fakes for tests

#[allow(clippy::module_inception)]
mod collector;
pub mod mock;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod procfs;
pub mod traits;

use thiserror::Error;

pub use collector::Collector;
pub use mock::{MockFs, MockSource};
#[cfg(feature = "mysql")]
pub use mysql::MysqlSource;
pub use procfs::{OsCollector, ServerDirs};
pub use traits::{FileSystem, MasterStatus, Mount, RealFs, SlaveStatus, StatusSource};

/// Error type for sampling.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("cannot connect to MySQL: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("cannot parse {what}: {message}")]
    Parse { what: &'static str, message: String },
}
