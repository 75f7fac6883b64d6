pub mod manager;
pub mod model;
pub mod schema;

use thiserror::Error;

pub use manager::SampleStore;
pub use model::Snapshot;
pub use schema::{Metadata, SCHEMA_REVISION, StoreState};

pub(crate) use schema::{read_json, write_json_atomic};

/// Error type for the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("store metadata error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timestamp out of range: {0}")]
    Timestamp(i64),
}
