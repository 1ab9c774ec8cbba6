//! Errors raised by the pool manager, discovery, and lifecycle layers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("store error: {0}")]
    Store(#[from] jobforge_store::StoreError),

    #[error("executor error: {0}")]
    Executor(#[from] jobforge_executor::ExecutorError),

    #[error("no executor registered for execution mode {0:?}")]
    NoExecutor(jobforge_protocol::worker::ExecutionMode),

    #[error("worker {0} did not register within the startup timeout")]
    RegistrationTimedOut(String),
}
