//! The worker executor capability (spec §4.D): one contract, two
//! concrete implementations (`direct`, `docker`) that share nothing but
//! this trait — deliberately not a shared base class with overridden
//! behavior.

use async_trait::async_trait;

use crate::error::Result;
use crate::stats::WorkerStats;

/// Parameters needed to launch one worker process, independent of
/// execution mode. Mode-specific fields (`image`, `memory_limit`) are
/// read only by the executor that understands them.
#[derive(Debug, Clone)]
pub struct WorkerLaunchConfig {
    pub worker_type: String,
    pub db_path: String,
    pub workspace_path: String,
    pub log_level: String,
    /// Container image, used only by the docker executor.
    pub image: Option<String>,
    /// Container memory limit (e.g. "512m"), used only by the docker
    /// executor.
    pub memory_limit: Option<String>,
    /// Container network to attach to, used only by the docker executor.
    pub network: Option<String>,
    pub max_job_time_secs: Option<u64>,
}

/// A launcher abstraction for worker processes in one execution mode
/// (spec GLOSSARY: Executor).
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    /// Launch worker `index` of `worker_type`. Returns the executor id on
    /// success. Start failures are logged by the implementation and
    /// reported as `Ok(None)` — never propagated — so partial pool
    /// startup is tolerable (spec §4.D).
    async fn start_worker(&self, index: usize, config: &WorkerLaunchConfig) -> Result<Option<String>>;

    /// Stop the worker identified by `executor_id`. Returns whether the
    /// worker was found and signaled.
    async fn stop_worker(&self, executor_id: &str) -> Result<bool>;

    async fn is_worker_running(&self, executor_id: &str) -> Result<bool>;

    async fn get_worker_stats(&self, executor_id: &str) -> Result<Option<WorkerStats>>;

    /// Release any resources this executor is still holding (e.g. a
    /// Docker client connection). Called once at process shutdown.
    async fn cleanup(&self) -> Result<()>;
}
