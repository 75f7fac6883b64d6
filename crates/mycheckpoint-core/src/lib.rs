//! mycheckpoint-core: MySQL status sampling, rollups and alerting.
//!
//! Provides:
//! - `collector`: status variables, global variables, replication and OS metrics
//! - `metrics`: fixed counter classification and value normalization
//! - `storage`: append-only sample store, schema and deploy metadata
//! - `rates`: per-interval diffs and per-second rates
//! - `rollup`: hour/day aggregation, recent windows, 10-minute re-gridding
//! - `report`: derived report metrics, parameter changes, brief text report
//! - `alert`: condition expressions, pending-alert state machine
//! - `notify`: outbound notification delivery
//! - `config`: settings and TOML config file
//! - `pipeline`: deploy pass and the collect → store → alert cycle

pub mod alert;
pub mod collector;
pub mod config;
mod error;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod rates;
pub mod report;
pub mod rollup;
pub mod storage;

pub use error::{Error, Result};
pub use pipeline::Context;
