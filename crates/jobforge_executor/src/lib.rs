//! Worker process and container lifecycle execution (spec §4.D).
//!
//! One contract (`WorkerExecutor`), two implementations that share
//! nothing but the trait: `DirectExecutor` spawns subprocesses,
//! `DockerExecutor` (behind the `docker` feature) launches containers.
//! Neither knows about the other; the pool manager picks one per worker
//! type at configuration time.

pub mod contract;
pub mod direct;
#[cfg(feature = "docker")]
pub mod docker;
pub mod error;
pub mod stats;

pub use contract::{WorkerExecutor, WorkerLaunchConfig};
pub use error::{ExecutorError, Result};
pub use stats::WorkerStats;

pub use direct::DirectExecutor;
#[cfg(feature = "docker")]
pub use docker::DockerExecutor;
