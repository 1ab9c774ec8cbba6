//! Errors raised by worker executors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker {0} did not stop within the grace period")]
    StopTimedOut(String),

    #[cfg(feature = "docker")]
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}
