//! The worker-side half of spec §6's registration and job-claim
//! protocol.
//!
//! Grounded in `casparian_worker`'s `Worker::connect`/`Worker::run` shape
//! (register, then loop: fetch, process, report), but reduced to an
//! orchestration shell: domain execution (what a "notebook" or
//! "plantuml" job actually does) is opaque to this crate and supplied by
//! the caller as a `JobHandler`, per spec.md §1's Non-goals.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use jobforge_protocol::error::CategorizedError;
use jobforge_protocol::job::{Job, JobType};
use jobforge_protocol::worker::{ExecutionMode, WorkerId, WorkerStatus};
use jobforge_store::JobsDb;

/// How a worker turns a claimed `Job` into a completed or failed outcome.
/// The worker runtime never inspects `job.payload` itself; the handler
/// owns reading it, executing the domain-specific transform, and writing
/// `job.output_file`.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), CategorizedError>;
}

/// A handler that refuses every job. The `jobforge-worker` binary uses
/// this by default so it can exercise registration/heartbeat/claim
/// end-to-end without pretending to implement notebook or diagram
/// rendering; real deployments construct `WorkerRuntime` directly with a
/// domain-specific `JobHandler`.
pub struct UnimplementedHandler;

#[async_trait::async_trait]
impl JobHandler for UnimplementedHandler {
    async fn handle(&self, job: &Job) -> Result<(), CategorizedError> {
        Err(CategorizedError {
            error_type: jobforge_protocol::error::ErrorKind::Configuration,
            category: "no_handler_configured".to_string(),
            message: format!("no domain handler configured for job type '{}'", job.job_type),
            actionable_guidance: "run this worker type through a deployment that supplies a \
                 JobHandler for its domain logic"
                .to_string(),
            file_path: job.input_file.clone(),
            job_id: Some(job.id),
            worker_id: None,
            correlation_id: job.correlation_id.clone(),
            details: Default::default(),
        })
    }
}

/// Cadence and identity parameters for one worker process (spec §6's
/// registration environment).
#[derive(Debug, Clone)]
pub struct WorkerRuntimeConfig {
    pub worker_type: String,
    pub executor_id: String,
    pub heartbeat_interval: Duration,
    pub claim_poll_interval: Duration,
}

impl WorkerRuntimeConfig {
    /// Heartbeat well under the 30s staleness window discovery enforces.
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

    pub fn new(worker_type: impl Into<String>, executor_id: impl Into<String>) -> Self {
        Self {
            worker_type: worker_type.into(),
            executor_id: executor_id.into(),
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            claim_poll_interval: Self::DEFAULT_CLAIM_POLL_INTERVAL,
        }
    }
}

/// Runs one worker process's full lifecycle: register, heartbeat, claim,
/// process, report, and (on graceful shutdown) deregister.
pub struct WorkerRuntime {
    jobs_db: Arc<JobsDb>,
    handler: Arc<dyn JobHandler>,
    config: WorkerRuntimeConfig,
}

impl WorkerRuntime {
    pub fn new(jobs_db: Arc<JobsDb>, handler: Arc<dyn JobHandler>, config: WorkerRuntimeConfig) -> Self {
        Self { jobs_db, handler, config }
    }

    /// Run until `shutdown` is cancelled. On graceful shutdown the worker
    /// row is deleted (spec §6: "on graceful shutdown it deletes its
    /// row"); a killed process simply stops heartbeating and is later
    /// classified dead by discovery.
    pub async fn run(self, shutdown: CancellationToken) -> jobforge_store::Result<()> {
        let job_type: JobType = self
            .config
            .worker_type
            .parse()
            .map_err(|e| jobforge_store::StoreError::invalid_state(format!("{e}")))?;
        let execution_mode = ExecutionMode::from_executor_id(&self.config.executor_id);

        let worker_id = self
            .jobs_db
            .workers
            .register(&self.config.worker_type, execution_mode, &self.config.executor_id)
            .await?;
        info!(worker_id, worker_type = %self.config.worker_type, executor_id = %self.config.executor_id, "worker registered");

        let heartbeat = self.spawn_heartbeat(worker_id, shutdown.clone());

        let result = self.claim_loop(worker_id, job_type, shutdown.clone()).await;

        shutdown.cancel();
        let _ = heartbeat.await;

        if let Err(err) = self.jobs_db.workers.delete(worker_id).await {
            warn!(worker_id, error = %err, "failed to deregister worker on shutdown");
        } else {
            info!(worker_id, "worker deregistered");
        }

        result
    }

    fn spawn_heartbeat(&self, worker_id: WorkerId, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.jobs_db.workers.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = registry.heartbeat(worker_id).await {
                            error!(worker_id, error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    async fn claim_loop(
        &self,
        worker_id: WorkerId,
        job_type: JobType,
        shutdown: CancellationToken,
    ) -> jobforge_store::Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let claimed = self.jobs_db.queue.claim_next(job_type, worker_id).await?;

            let Some(job) = claimed else {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.config.claim_poll_interval) => {}
                }
                continue;
            };

            self.jobs_db.workers.set_status(worker_id, WorkerStatus::Busy).await?;
            info!(worker_id, job_id = job.id, input_file = %job.input_file, "job claimed");

            match self.handler.handle(&job).await {
                Ok(()) => {
                    self.jobs_db.queue.complete(job.id).await?;
                    self.jobs_db.workers.record_outcome(worker_id, true).await?;
                    info!(worker_id, job_id = job.id, "job completed");
                }
                Err(err) => {
                    self.jobs_db.queue.fail_or_retry(job.id, &err.to_string()).await?;
                    self.jobs_db.workers.record_outcome(worker_id, false).await?;
                    warn!(worker_id, job_id = job.id, error = %err, "job failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_store::pool::DbConfig;
    use serde_json::Value;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, job: &Job) -> Result<(), CategorizedError> {
            tokio::fs::write(&job.output_file, b"ok").await.map_err(|e| CategorizedError {
                error_type: jobforge_protocol::error::ErrorKind::Infrastructure,
                category: "io".to_string(),
                message: e.to_string(),
                actionable_guidance: String::new(),
                file_path: job.input_file.clone(),
                job_id: Some(job.id),
                worker_id: None,
                correlation_id: None,
                details: Default::default(),
            })
        }
    }

    #[tokio::test]
    async fn claims_and_completes_a_job() {
        let jobs_db = Arc::new(JobsDb::open(&DbConfig::memory()).await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let output_file = dir.path().join("out.html");

        jobs_db
            .queue
            .submit(
                JobType::Notebook,
                "in.ipynb",
                output_file.to_str().unwrap(),
                "hash1",
                &Value::Null,
                0,
                3,
                None,
            )
            .await
            .unwrap();

        let config = WorkerRuntimeConfig {
            claim_poll_interval: Duration::from_millis(10),
            ..WorkerRuntimeConfig::new("notebook", "direct-notebook-0-abcd1234")
        };
        let runtime = WorkerRuntime::new(jobs_db.clone(), Arc::new(EchoHandler), config);
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown_clone.cancel();
        });
        runtime.run(shutdown).await.unwrap();

        let stats = jobs_db.queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert!(tokio::fs::read(&output_file).await.is_ok());
    }

    #[tokio::test]
    async fn unimplemented_handler_fails_every_job() {
        let jobs_db = Arc::new(JobsDb::open(&DbConfig::memory()).await.unwrap());
        jobs_db
            .queue
            .submit(JobType::Notebook, "in.ipynb", "out.html", "hash1", &Value::Null, 0, 1, None)
            .await
            .unwrap();

        let config = WorkerRuntimeConfig {
            claim_poll_interval: Duration::from_millis(10),
            ..WorkerRuntimeConfig::new("notebook", "direct-notebook-0-abcd1234")
        };
        let runtime = WorkerRuntime::new(jobs_db.clone(), Arc::new(UnimplementedHandler), config);
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown_clone.cancel();
        });
        runtime.run(shutdown).await.unwrap();

        let stats = jobs_db.queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
    }
}
