//! The driver-facing submission backend (spec §4.H).
//!
//! Ported from `original_source/src/clx/infrastructure/backends/sqlite_backend.py`:
//! `execute_operation`'s cache-then-cache-then-availability-then-submit
//! ordering, the `service_to_job_type` map, the periodic dead-worker
//! rescue, and `wait_for_completion`'s poll/complete/fail/timeout loop.
//! `active_jobs` is an owned, injected `tokio::sync::Mutex` field rather
//! than module-level state (spec.md §9's "shared mutable singleton"
//! re-architecture).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use jobforge_protocol::cache::ResultCacheRow;
use jobforge_protocol::error::{categorize_job_error, CategorizedError};
use jobforge_protocol::job::{JobId, JobStatus, JobType};
use jobforge_protocol::operation::{Operation, Payload};
use jobforge_pool::HealthChecker;
use jobforge_store::{CacheDb, JobsDb};

use crate::error::{BackendError, Result};
use crate::progress::{BuildReporter, LoggingBuildReporter, LoggingProgressTracker, ProgressTracker};

/// How many versions of a cache-store the backend retains when writing a
/// reconstructed result back to the artifact cache on job completion.
const RESULT_CACHE_RETAIN: i64 = 3;

const DEAD_WORKER_RESCUE_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_TOTAL_WAIT_TIMEOUT: Duration = Duration::from_secs(1200);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct ActiveJob {
    job_type: JobType,
    input_file: String,
    output_file: String,
    correlation_id: Option<String>,
}

/// Tunables a driver may override; defaults match spec §4.H / §5.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub poll_interval: Duration,
    pub total_wait_timeout: Duration,
    /// Bypass the worker-availability gate (spec §4.H step 3's "unless
    /// explicitly bypassed" — used by tests and single-shot CLIs that
    /// trust the caller to have started workers).
    pub skip_worker_check: bool,
    /// Enabled by default; disabling drops the artifact-cache short
    /// circuit and the completion-time cache store.
    pub artifact_cache_enabled: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            total_wait_timeout: DEFAULT_TOTAL_WAIT_TIMEOUT,
            skip_worker_check: false,
            artifact_cache_enabled: true,
        }
    }
}

/// The driver-facing entry point: submit operations, wait for completion,
/// shut down cleanly.
pub struct SubmissionBackend {
    jobs_db: Arc<JobsDb>,
    cache_db: Option<Arc<CacheDb>>,
    health: Arc<HealthChecker>,
    workspace_path: PathBuf,
    options: BackendOptions,
    progress: Arc<dyn ProgressTracker>,
    reporter: Arc<dyn BuildReporter>,
    active_jobs: Mutex<HashMap<JobId, ActiveJob>>,
}

impl SubmissionBackend {
    pub fn new(
        jobs_db: Arc<JobsDb>,
        cache_db: Option<Arc<CacheDb>>,
        health: Arc<HealthChecker>,
        workspace_path: impl Into<PathBuf>,
        options: BackendOptions,
    ) -> Self {
        Self {
            jobs_db,
            cache_db,
            health,
            workspace_path: workspace_path.into(),
            options,
            progress: Arc::new(LoggingProgressTracker::new()),
            reporter: Arc::new(LoggingBuildReporter),
            active_jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_progress_tracker(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_build_reporter(mut self, reporter: Arc<dyn BuildReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    fn resolve_output_path(&self, output_file: &str) -> PathBuf {
        let path = Path::new(output_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_path.join(path)
        }
    }

    fn service_to_job_type(service_name: &str) -> Result<JobType> {
        match service_name {
            "notebook-processor" => Ok(JobType::Notebook),
            "plantuml-converter" => Ok(JobType::PlantUml),
            "drawio-converter" => Ok(JobType::DrawIo),
            other => Err(BackendError::UnknownService(other.to_string())),
        }
    }

    /// Spec §4.H `ExecuteOperation`: artifact-cache short-circuit,
    /// queue-cache short-circuit, worker-availability gate, submit,
    /// progress tracking.
    pub async fn execute_operation(&self, operation: &Operation, payload: &Payload) -> Result<()> {
        if self.options.artifact_cache_enabled {
            if let Some(cache_db) = &self.cache_db {
                let hit = cache_db
                    .results
                    .get(&payload.input_file, &payload.content_hash, &payload.output_metadata)
                    .await?;

                if let Some(row) = hit {
                    let output_path = self.resolve_output_path(&payload.output_file);
                    if let Some(parent) = output_path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&output_path, &row.result).await?;

                    for issue in cache_db
                        .issues
                        .get_issues(&payload.input_file, &payload.content_hash, &payload.output_metadata)
                        .await?
                    {
                        let categorized = categorize_job_error(
                            "cache",
                            &payload.input_file,
                            &issue.payload,
                            None,
                            payload.correlation_id.clone(),
                        )
                        .tagged_from_cache();
                        self.reporter.report_error(&categorized);
                    }

                    debug!(input_file = %payload.input_file, "artifact cache hit; skipped worker execution");
                    return Ok(());
                }
            }
        }

        if let Some(metadata) = self
            .jobs_db
            .queue
            .check_cache(&payload.output_file, &payload.content_hash)
            .await?
        {
            let _ = metadata;
            let output_path = self.resolve_output_path(&payload.output_file);
            if output_path.exists() {
                debug!(output_file = %payload.output_file, "queue cache hit");
                return Ok(());
            }
            warn!(output_file = %payload.output_file, "queue cache indicated output exists but it was not found on disk");
        }

        let job_type = Self::service_to_job_type(&operation.service_name)?;

        if !self.options.skip_worker_check {
            let available = self.health.count_healthy_workers(job_type.as_str()).await?;
            if available == 0 {
                return Err(BackendError::NoWorkers(job_type.as_str().to_string()));
            }
            debug!(job_type = %job_type, available, "worker availability check passed");
        }

        let job_id = self
            .jobs_db
            .queue
            .submit(
                job_type,
                &payload.input_file,
                &payload.output_file,
                &payload.content_hash,
                &payload.to_json(),
                0,
                jobforge_protocol::job::Job::DEFAULT_MAX_ATTEMPTS,
                payload.correlation_id.as_deref(),
            )
            .await?;

        self.active_jobs.lock().await.insert(
            job_id,
            ActiveJob {
                job_type,
                input_file: payload.input_file.clone(),
                output_file: payload.output_file.clone(),
                correlation_id: payload.correlation_id.clone(),
            },
        );

        self.progress
            .job_submitted(job_id, job_type.as_str(), &payload.input_file);

        info!(job_id, job_type = %job_type, input_file = %payload.input_file, output_file = %payload.output_file, "job submitted");
        Ok(())
    }

    /// Spec §4.H `WaitForCompletion`: poll every `poll_interval`, rescue
    /// dead-worker jobs every ~5s, cache-store on completion, categorize
    /// and report on failure, bounded by a total-wait timeout.
    pub async fn wait_for_completion(&self) -> Result<bool> {
        if self.active_jobs.lock().await.is_empty() {
            return Ok(true);
        }

        let start = Instant::now();
        let mut last_rescue = Instant::now();
        let mut any_failed = false;

        loop {
            if last_rescue.elapsed() >= DEAD_WORKER_RESCUE_INTERVAL {
                let rescued = self.jobs_db.queue.reset_jobs_of_dead_workers().await?;
                if !rescued.is_empty() {
                    info!(count = rescued.len(), "reset job(s) stuck under dead workers");
                }
                last_rescue = Instant::now();
            }

            let ids: Vec<JobId> = self.active_jobs.lock().await.keys().copied().collect();
            for job_id in ids {
                let job = match self.jobs_db.queue.get(job_id).await {
                    Ok(job) => job,
                    Err(err) => {
                        warn!(job_id, error = %err, "active job vanished from the queue");
                        self.active_jobs.lock().await.remove(&job_id);
                        continue;
                    }
                };

                match job.status {
                    JobStatus::Completed => {
                        self.on_job_completed(job_id, &job).await?;
                        self.active_jobs.lock().await.remove(&job_id);
                    }
                    JobStatus::Failed => {
                        self.on_job_failed(job_id, &job).await;
                        any_failed = true;
                        self.active_jobs.lock().await.remove(&job_id);
                    }
                    JobStatus::Pending | JobStatus::Processing => {}
                }
            }

            if self.active_jobs.lock().await.is_empty() {
                break;
            }

            if start.elapsed() > self.options.total_wait_timeout {
                let remaining = self.active_jobs.lock().await.len();
                return Err(BackendError::WaitTimedOut(self.options.total_wait_timeout, remaining));
            }

            tokio::time::sleep(self.options.poll_interval).await;
        }

        self.progress.log_summary();
        Ok(!any_failed)
    }

    async fn on_job_completed(&self, job_id: JobId, job: &jobforge_protocol::job::Job) -> Result<()> {
        self.progress.job_completed(job_id);
        info!(job_id, input_file = %job.input_file, output_file = %job.output_file, "job completed");

        if !self.options.artifact_cache_enabled {
            return Ok(());
        }
        let Some(cache_db) = &self.cache_db else {
            return Ok(());
        };

        let output_path = self.resolve_output_path(&job.output_file);
        let Ok(result_bytes) = tokio::fs::read(&output_path).await else {
            warn!(job_id, output_file = %job.output_file, "job completed but output file is unreadable; skipping cache store");
            return Ok(());
        };

        let output_metadata = job
            .payload
            .get("output_metadata")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let correlation_id = job
            .payload
            .get("correlation_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let row = ResultCacheRow {
            file_path: job.input_file.clone(),
            content_hash: job.content_hash.clone(),
            output_metadata,
            correlation_id,
            result: result_bytes,
            created_at: chrono::Utc::now(),
        };

        cache_db.results.store_latest(&row, RESULT_CACHE_RETAIN).await?;
        debug!(job_id, input_file = %job.input_file, "stored reconstructed result in artifact cache");
        Ok(())
    }

    async fn on_job_failed(&self, job_id: JobId, job: &jobforge_protocol::job::Job) {
        let error_message = job.error.as_deref().unwrap_or("unknown error");
        let categorized: CategorizedError = categorize_job_error(
            job.job_type.as_str(),
            &job.input_file,
            error_message,
            Some(job_id),
            job.correlation_id.clone(),
        );

        self.reporter.report_error(&categorized);
        self.progress.job_failed(job_id, &categorized.message);
    }

    /// Spec §4.H `Shutdown`: wait out remaining jobs with a short grace,
    /// then give up and leave whatever is still pending in-queue for a
    /// later session.
    pub async fn shutdown(&self) -> Result<()> {
        let remaining = self.active_jobs.lock().await.len();
        if remaining == 0 {
            return Ok(());
        }

        warn!(remaining, "shutdown called with jobs still pending");
        match tokio::time::timeout(SHUTDOWN_GRACE, self.wait_for_completion()).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                let still_pending = self.active_jobs.lock().await.len();
                warn!(still_pending, "shutdown grace period elapsed; leaving jobs in-queue");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_pool::HealthChecker;
    use jobforge_store::pool::DbConfig;
    use std::collections::HashMap as StdHashMap;

    async fn setup() -> (Arc<JobsDb>, Arc<CacheDb>, Arc<HealthChecker>, tempfile::TempDir) {
        let jobs_db = Arc::new(JobsDb::open(&DbConfig::memory()).await.unwrap());
        let cache_db = Arc::new(CacheDb::open(&DbConfig::memory()).await.unwrap());
        let health = Arc::new(HealthChecker::new(
            jobs_db.workers.clone(),
            StdHashMap::new(),
            Arc::new(jobforge_protocol::time::SystemClock),
        ));
        let workspace = tempfile::tempdir().unwrap();
        (jobs_db, cache_db, health, workspace)
    }

    fn payload(input: &str, output: &str) -> Payload {
        Payload {
            input_file: input.to_string(),
            output_file: output.to_string(),
            content_hash: "hash1".to_string(),
            correlation_id: None,
            output_metadata: "speaker/python/en".to_string(),
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn execute_operation_rejects_unknown_service() {
        let (jobs_db, cache_db, health, workspace) = setup().await;
        let backend = SubmissionBackend::new(
            jobs_db,
            Some(cache_db),
            health,
            workspace.path(),
            BackendOptions::default(),
        );

        let err = backend
            .execute_operation(&Operation::new("mystery-service"), &payload("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownService(_)));
    }

    #[tokio::test]
    async fn execute_operation_refuses_without_healthy_workers() {
        let (jobs_db, cache_db, health, workspace) = setup().await;
        let backend = SubmissionBackend::new(
            jobs_db,
            Some(cache_db),
            health,
            workspace.path(),
            BackendOptions::default(),
        );

        let err = backend
            .execute_operation(&Operation::new("notebook-processor"), &payload("a.ipynb", "a.html"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NoWorkers(_)));
    }

    #[tokio::test]
    async fn execute_operation_submits_when_check_is_skipped() {
        let (jobs_db, cache_db, health, workspace) = setup().await;
        let mut options = BackendOptions::default();
        options.skip_worker_check = true;
        let backend = SubmissionBackend::new(jobs_db.clone(), Some(cache_db), health, workspace.path(), options);

        backend
            .execute_operation(&Operation::new("notebook-processor"), &payload("a.ipynb", "a.html"))
            .await
            .unwrap();

        let stats = jobs_db.queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn wait_for_completion_returns_true_immediately_with_no_active_jobs() {
        let (jobs_db, cache_db, health, workspace) = setup().await;
        let backend = SubmissionBackend::new(jobs_db, Some(cache_db), health, workspace.path(), BackendOptions::default());
        assert!(backend.wait_for_completion().await.unwrap());
    }

    #[tokio::test]
    async fn artifact_cache_hit_writes_output_and_skips_submission() {
        let (jobs_db, cache_db, health, workspace) = setup().await;
        cache_db
            .results
            .store(&ResultCacheRow {
                file_path: "a.ipynb".to_string(),
                content_hash: "hash1".to_string(),
                output_metadata: "speaker/python/en".to_string(),
                correlation_id: None,
                result: b"<html>cached</html>".to_vec(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let mut options = BackendOptions::default();
        options.skip_worker_check = true;
        let backend = SubmissionBackend::new(jobs_db.clone(), Some(cache_db), health, workspace.path(), options);

        backend
            .execute_operation(&Operation::new("notebook-processor"), &payload("a.ipynb", "out/a.html"))
            .await
            .unwrap();

        let written = tokio::fs::read(workspace.path().join("out/a.html")).await.unwrap();
        assert_eq!(written, b"<html>cached</html>");

        let stats = jobs_db.queue.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
    }
}
