use thiserror::Error;

use crate::alert::AlertStoreError;
use crate::collector::CollectError;
use crate::config::ConfigError;
use crate::notify::NotifyError;
use crate::storage::StoreError;

/// Fatal errors for one invocation of the pipeline.
///
/// Anything that reaches this type aborts the run with a nonzero exit code.
/// Recoverable faults (replication privileges, expression evaluation,
/// alert delivery) are handled where they occur and never get here.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    AlertStore(#[from] AlertStoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("notification failed: {0}")]
    Notify(#[from] NotifyError),

    #[error("data directory needs redeploy: {0}")]
    RedeployNeeded(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
