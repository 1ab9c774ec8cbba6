//! Pool manager (spec §4.E): owns the fleet across all job types for one
//! process session — start, stop, and background health monitoring.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use jobforge_executor::{WorkerExecutor, WorkerLaunchConfig};
use jobforge_protocol::job::JobType;
use jobforge_protocol::worker::{ExecutionMode, WorkerId, WorkerStatus};
use jobforge_store::{JobsDb, WorkerEventLogger};

use crate::config::{ResolvedWorkerConfig, WorkersManagementConfig};
use crate::error::{PoolError, Result};
use crate::health::HealthChecker;

/// How long `StartPools` waits for a freshly-launched worker to
/// self-register before giving up on that slot (spec §4.E/§5).
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
struct LaunchedWorker {
    executor_id: String,
    worker_id: WorkerId,
    execution_mode: ExecutionMode,
}

/// Static, per-process parameters every launched worker needs regardless
/// of type (spec §6's registration-protocol environment).
#[derive(Debug, Clone)]
pub struct PoolEnvironment {
    pub db_path: String,
    pub workspace_path: String,
    pub log_level: String,
}

pub struct PoolManager {
    jobs_db: Arc<JobsDb>,
    executors: HashMap<ExecutionMode, Arc<dyn WorkerExecutor>>,
    health: Arc<HealthChecker>,
    events: Arc<WorkerEventLogger>,
    environment: PoolEnvironment,
    fleet: Mutex<HashMap<String, Vec<LaunchedWorker>>>,
    targets: Mutex<HashMap<String, ResolvedWorkerConfig>>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PoolManager {
    pub fn new(
        jobs_db: Arc<JobsDb>,
        executors: HashMap<ExecutionMode, Arc<dyn WorkerExecutor>>,
        health: Arc<HealthChecker>,
        environment: PoolEnvironment,
    ) -> Self {
        let events = jobs_db.events.clone();
        Self {
            jobs_db,
            executors,
            health,
            events,
            environment,
            fleet: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        }
    }

    fn launch_config(&self, resolved: &ResolvedWorkerConfig) -> WorkerLaunchConfig {
        WorkerLaunchConfig {
            worker_type: resolved.worker_type.clone(),
            db_path: self.environment.db_path.clone(),
            workspace_path: self.environment.workspace_path.clone(),
            log_level: self.environment.log_level.clone(),
            image: resolved.image.clone(),
            memory_limit: resolved.memory_limit.clone(),
            network: None,
            max_job_time_secs: resolved.max_job_time_secs,
        }
    }

    /// Launch one worker slot and wait for it to self-register. Start
    /// failures (executor returns `None`) and registration timeouts are
    /// logged and degrade the available worker count rather than
    /// propagating — other slots still proceed (spec §4.D/§4.E/§7).
    async fn launch_one(
        &self,
        index: usize,
        resolved: &ResolvedWorkerConfig,
    ) -> Option<LaunchedWorker> {
        let executor = match self.executors.get(&resolved.execution_mode) {
            Some(executor) => executor.clone(),
            None => {
                error!(
                    worker_type = %resolved.worker_type,
                    mode = ?resolved.execution_mode,
                    "no executor registered for this execution mode"
                );
                return None;
            }
        };

        let config = self.launch_config(resolved);
        let executor_id = match executor.start_worker(index, &config).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                error!(worker_type = %resolved.worker_type, index, "executor declined to start worker");
                return None;
            }
            Err(err) => {
                error!(worker_type = %resolved.worker_type, index, error = %err, "start_worker failed");
                return None;
            }
        };

        let deadline = tokio::time::Instant::now() + REGISTRATION_TIMEOUT;
        loop {
            match self.jobs_db.workers.get_by_executor_id(&executor_id).await {
                Ok(Some(worker)) => {
                    return Some(LaunchedWorker {
                        executor_id,
                        worker_id: worker.id,
                        execution_mode: resolved.execution_mode,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(executor_id, error = %err, "error while polling for worker registration");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(executor_id, "worker did not register within the startup timeout; stopping it");
                let _ = executor.stop_worker(&executor_id).await;
                return None;
            }
            tokio::time::sleep(REGISTRATION_POLL_INTERVAL).await;
        }
    }

    /// Start every configured worker-type fleet. Zero-count types are a
    /// no-op (spec §8 boundary behavior).
    pub async fn start_pools(&self, config: &WorkersManagementConfig) -> Result<()> {
        for job_type in JobType::all() {
            let resolved = config.resolve(job_type.as_str());
            self.launch_additional(&resolved, resolved.count as usize).await?;
        }
        Ok(())
    }

    /// Launch `additional` more workers of `resolved.worker_type`,
    /// recording `resolved` as that type's replacement target for future
    /// monitor top-ups. Shared by `start_pools` (fresh fill) and the
    /// lifecycle manager's reuse-policy top-up (partial fill against an
    /// already-healthy fleet).
    pub async fn launch_additional(
        &self,
        resolved: &ResolvedWorkerConfig,
        additional: usize,
    ) -> Result<usize> {
        self.targets
            .lock()
            .await
            .insert(resolved.worker_type.clone(), resolved.clone());

        if additional == 0 {
            return Ok(0);
        }

        self.events
            .pool_starting(&resolved.worker_type, additional)
            .await?;

        let mut fleet = self.fleet.lock().await;
        let launched = fleet.entry(resolved.worker_type.clone()).or_default();
        let start_index = launched.len();
        let mut started = 0usize;
        for i in start_index..(start_index + additional) {
            if let Some(worker) = self.launch_one(i, resolved).await {
                launched.push(worker);
                started += 1;
            }
        }

        self.events
            .pool_started(&resolved.worker_type, started)
            .await?;

        Ok(started)
    }

    /// Stop every launched worker in parallel, then forget them. Workers
    /// that fail to stop cleanly are still dropped from the fleet; their
    /// rows are left for a later health sweep to classify as dead.
    pub async fn stop_pools(&self) -> Result<()> {
        let mut fleet = self.fleet.lock().await;

        for (worker_type, workers) in fleet.iter() {
            self.events.pool_stopping(worker_type).await?;

            let mut handles = Vec::new();
            for worker in workers {
                let Some(executor) = self.executors.get(&worker.execution_mode).cloned() else {
                    continue;
                };
                let executor_id = worker.executor_id.clone();
                handles.push(tokio::spawn(async move {
                    executor.stop_worker(&executor_id).await
                }));
            }
            for handle in handles {
                if let Ok(Err(err)) = handle.await {
                    warn!(worker_type, error = %err, "error stopping worker");
                }
            }

            for worker in workers {
                let _ = self.jobs_db.workers.delete(worker.worker_id).await;
            }

            self.events.pool_stopped(worker_type).await?;
        }

        fleet.clear();
        Ok(())
    }

    /// Total workers currently tracked as launched by this manager
    /// (used by the lifecycle manager's reuse-policy accounting).
    pub async fn launched_count(&self, worker_type: &str) -> usize {
        self.fleet
            .lock()
            .await
            .get(worker_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Spawn the background health-monitoring task (spec §4.E
    /// `StartMonitoring`). Cooperatively cancellable via `stop_monitoring`
    /// or `stop_pools`/drop of the returned token.
    pub async fn start_monitoring(self: &Arc<Self>, check_interval: Duration) {
        let mut guard = self.monitor.lock().await;
        if guard.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let child_token = token.clone();
        let manager = self.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = child_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = manager.run_monitor_sweep().await {
                            error!(error = %err, "pool monitor sweep failed; continuing");
                        }
                    }
                }
            }
        });

        *guard = Some((token, handle));
    }

    /// Cancel and join the monitoring task, if one is running.
    pub async fn stop_monitoring(&self) {
        let mut guard = self.monitor.lock().await;
        if let Some((token, handle)) = guard.take() {
            token.cancel();
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    /// One monitoring iteration: classify every worker, reclaim jobs from
    /// hung/dead ones, and top up the fleet to its configured target.
    async fn run_monitor_sweep(&self) -> Result<()> {
        let discovered = self.health.discover_workers(None, None).await?;
        let targets = self.targets.lock().await.clone();
        let mut fleet = self.fleet.lock().await;

        for entry in discovered {
            let worker = entry.worker;
            // Dead is terminal (nothing left to reclaim or re-mark); skip
            // it and anything already healthy. Hung workers are still
            // re-evaluated here so a worker that stops running after
            // going hung can still complete the busy -> hung -> dead
            // transition instead of sticking at `hung` forever.
            if worker.status == WorkerStatus::Dead || entry.is_healthy {
                continue;
            }

            let still_running = match self.executors.get(&worker.execution_mode) {
                Some(executor) => executor
                    .is_worker_running(&worker.executor_id)
                    .await
                    .unwrap_or(false),
                None => false,
            };

            let reason = if still_running {
                self.events
                    .worker_marked_hung(&worker.worker_type, &worker.executor_id)
                    .await?;
                "worker hung: stale heartbeat, process still running"
            } else {
                self.events
                    .worker_marked_dead(&worker.worker_type, &worker.executor_id)
                    .await?;
                "worker dead: stale heartbeat, process not running"
            };

            let reset = self
                .health
                .reclaim_worker(&self.jobs_db.queue, worker.id, still_running, reason)
                .await?;
            if !reset.is_empty() {
                info!(worker_id = worker.id, jobs = reset.len(), "reclaimed jobs from unhealthy worker");
            }

            if let Some(launched) = fleet.get_mut(&worker.worker_type) {
                launched.retain(|w| w.worker_id != worker.id);
            }

            if let Some(target) = targets.get(&worker.worker_type) {
                let current = fleet.get(&worker.worker_type).map(Vec::len).unwrap_or(0);
                if current < target.count as usize {
                    if let Some(replacement) = self.launch_one(current, target).await {
                        fleet.entry(worker.worker_type.clone()).or_default().push(replacement);
                    }
                }
            }
        }

        Ok(())
    }
}
