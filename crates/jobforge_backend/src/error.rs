//! Errors raised by the submission backend.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("store error: {0}")]
    Store(#[from] jobforge_store::StoreError),

    #[error("pool error: {0}")]
    Pool(#[from] jobforge_pool::PoolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("unknown service name: {0}")]
    UnknownService(String),

    #[error("no healthy workers available for job type '{0}'")]
    NoWorkers(String),

    #[error("wait_for_completion timed out after {0:?} with {1} job(s) still pending")]
    WaitTimedOut(std::time::Duration, usize),
}
