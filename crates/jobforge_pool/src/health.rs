//! Discovery & health (spec §4.F).
//!
//! `HealthChecker` is handed its executors by constructor injection
//! (`Executors: HashMap<ExecutionMode, Arc<dyn WorkerExecutor>>`) rather
//! than owning or constructing them, breaking the pool-manager/discovery/
//! executor cycle spec §9's Design Notes calls out: the pool manager
//! wires its executors into discovery after creating both, a one-way
//! dependency with no runtime cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use jobforge_executor::WorkerExecutor;
use jobforge_protocol::time::Clock;
use jobforge_protocol::worker::{ExecutionMode, Worker, WorkerId, WorkerStatus};
use jobforge_store::WorkerRegistry;

use crate::error::Result;

/// How stale a heartbeat may be before a worker is unhealthy regardless
/// of status (spec §4.F rule 2, §8's health-monotonicity property).
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// A worker row annotated with the two facts discovery exists to answer.
#[derive(Debug, Clone)]
pub struct DiscoveredWorker {
    pub worker: Worker,
    pub is_docker: bool,
    pub is_healthy: bool,
}

/// Per-worker-type rollup for `GetWorkerSummary`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerTypeSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

pub struct HealthChecker {
    registry: Arc<WorkerRegistry>,
    executors: HashMap<ExecutionMode, Arc<dyn WorkerExecutor>>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        executors: HashMap<ExecutionMode, Arc<dyn WorkerExecutor>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            executors,
            clock,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
        }
    }

    /// Enumerate workers, optionally filtered by type and/or status,
    /// annotated with `is_docker` and `is_healthy`.
    pub async fn discover_workers(
        &self,
        worker_type: Option<&str>,
        status_filter: Option<WorkerStatus>,
    ) -> Result<Vec<DiscoveredWorker>> {
        let mut discovered = Vec::new();
        for worker in self.registry.list().await? {
            if let Some(wanted_type) = worker_type {
                if worker.worker_type != wanted_type {
                    continue;
                }
            }
            if let Some(wanted_status) = status_filter {
                if worker.status != wanted_status {
                    continue;
                }
            }

            let is_healthy = self.check_worker_health(&worker).await;
            let is_docker = worker.execution_mode == ExecutionMode::Docker;
            discovered.push(DiscoveredWorker {
                worker,
                is_docker,
                is_healthy,
            });
        }
        Ok(discovered)
    }

    /// The three-rule health check (spec §4.F):
    /// 1. status is idle or busy;
    /// 2. heartbeat age <= 30s;
    /// 3. if an executor for this worker's mode is registered,
    ///    `is_worker_running` on its `executor_id` must be true.
    ///
    /// Executor errors count as unhealthy, never as an exception — a
    /// flaky Docker API call should degrade availability, not crash the
    /// monitor.
    pub async fn check_worker_health(&self, worker: &Worker) -> bool {
        if !worker.status.is_candidate_for_health() {
            return false;
        }

        let age = self.clock.now().signed_duration_since(worker.last_heartbeat);
        if age.num_seconds() < 0 || age.to_std().unwrap_or(Duration::MAX) > self.heartbeat_timeout {
            return false;
        }

        if let Some(executor) = self.executors.get(&worker.execution_mode) {
            match executor.is_worker_running(&worker.executor_id).await {
                Ok(running) => {
                    if !running {
                        return false;
                    }
                }
                Err(err) => {
                    warn!(
                        executor_id = %worker.executor_id,
                        error = %err,
                        "is_worker_running failed during health check; treating as unhealthy"
                    );
                    return false;
                }
            }
        }

        true
    }

    pub async fn count_healthy_workers(&self, worker_type: &str) -> Result<i64> {
        let stale_before = Utc::now() - chrono::Duration::from_std(self.heartbeat_timeout).unwrap();
        // The cheap path (heartbeat freshness from the indexed query)
        // undercounts workers whose process actually died without ever
        // going stale in the DB; confirm each candidate with the full
        // three-rule check so the count matches `discover_workers`.
        let candidates = self.registry.discover(worker_type).await?;
        let mut healthy = 0i64;
        for worker in candidates {
            if worker.last_heartbeat < stale_before {
                continue;
            }
            if self.check_worker_health(&worker).await {
                healthy += 1;
            }
        }
        Ok(healthy)
    }

    /// Per-worker-type `{total, healthy, unhealthy}` rollup across every
    /// registered worker.
    pub async fn worker_summary(&self) -> Result<HashMap<String, WorkerTypeSummary>> {
        let mut summary: HashMap<String, WorkerTypeSummary> = HashMap::new();
        for worker in self.registry.list().await? {
            let healthy = self.check_worker_health(&worker).await;
            let entry = summary.entry(worker.worker_type.clone()).or_default();
            entry.total += 1;
            if healthy {
                entry.healthy += 1;
            } else {
                entry.unhealthy += 1;
            }
        }
        Ok(summary)
    }

    /// Reset every in-flight job of a worker that has gone dead or hung,
    /// and persist the worker row's new status (spec §4.E / §4.F): `Hung`
    /// when the process is still running despite a stale heartbeat,
    /// `Dead` otherwise. Returns the job ids that were reset.
    pub async fn reclaim_worker(
        &self,
        jobs: &jobforge_store::JobQueue,
        worker_id: WorkerId,
        still_running: bool,
        reason: &str,
    ) -> Result<Vec<jobforge_protocol::job::JobId>> {
        let reset = jobs.reset_jobs_for_worker(worker_id, reason).await?;
        if still_running {
            self.registry.set_status(worker_id, WorkerStatus::Hung).await?;
        } else {
            self.registry.mark_dead(worker_id).await?;
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_protocol::time::FixedClock;
    use jobforge_store::pool::DbConfig;
    use jobforge_store::schema::ensure_jobs_schema;

    async fn registry() -> Arc<WorkerRegistry> {
        let pool = DbConfig::memory().connect().await.unwrap();
        ensure_jobs_schema(&pool).await.unwrap();
        Arc::new(WorkerRegistry::new(pool))
    }

    async fn registry_and_queue() -> (Arc<WorkerRegistry>, jobforge_store::JobQueue) {
        let pool = DbConfig::memory().connect().await.unwrap();
        ensure_jobs_schema(&pool).await.unwrap();
        (
            Arc::new(WorkerRegistry::new(pool.clone())),
            jobforge_store::JobQueue::new(pool),
        )
    }

    #[tokio::test]
    async fn stale_heartbeat_is_unhealthy_regardless_of_status() {
        let registry = registry().await;
        let id = registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-0-a")
            .await
            .unwrap();
        let worker = registry.get(id).await.unwrap();

        let far_future = Arc::new(FixedClock(Utc::now() + chrono::Duration::seconds(3600)));
        let checker = HealthChecker::new(registry.clone(), HashMap::new(), far_future);

        assert!(!checker.check_worker_health(&worker).await);
    }

    #[tokio::test]
    async fn fresh_heartbeat_with_no_executor_registered_is_healthy() {
        let registry = registry().await;
        let id = registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-0-a")
            .await
            .unwrap();
        let worker = registry.get(id).await.unwrap();

        let now = Arc::new(FixedClock(Utc::now()));
        let checker = HealthChecker::new(registry.clone(), HashMap::new(), now);

        assert!(checker.check_worker_health(&worker).await);
    }

    #[tokio::test]
    async fn hung_status_is_never_healthy() {
        let registry = registry().await;
        let id = registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-0-a")
            .await
            .unwrap();
        registry.set_status(id, WorkerStatus::Hung).await.unwrap();
        let worker = registry.get(id).await.unwrap();

        let now = Arc::new(FixedClock(Utc::now()));
        let checker = HealthChecker::new(registry.clone(), HashMap::new(), now);
        assert!(!checker.check_worker_health(&worker).await);
    }

    #[tokio::test]
    async fn worker_summary_counts_totals_and_health() {
        let registry = registry().await;
        registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-0-a")
            .await
            .unwrap();
        let dead_id = registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-1-b")
            .await
            .unwrap();
        registry.set_status(dead_id, WorkerStatus::Dead).await.unwrap();

        let now = Arc::new(FixedClock(Utc::now()));
        let checker = HealthChecker::new(registry.clone(), HashMap::new(), now);
        let summary = checker.worker_summary().await.unwrap();

        let notebook = summary.get("notebook").unwrap();
        assert_eq!(notebook.total, 2);
        assert_eq!(notebook.healthy, 1);
        assert_eq!(notebook.unhealthy, 1);
    }

    #[tokio::test]
    async fn reclaim_worker_marks_hung_when_still_running() {
        let (registry, queue) = registry_and_queue().await;
        let worker_id = registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-0-a")
            .await
            .unwrap();

        let checker = HealthChecker::new(registry.clone(), HashMap::new(), Arc::new(FixedClock(Utc::now())));
        checker
            .reclaim_worker(&queue, worker_id, true, "stale heartbeat, process still running")
            .await
            .unwrap();

        let worker = registry.get(worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Hung);
    }

    #[tokio::test]
    async fn reclaim_worker_marks_dead_when_not_running() {
        let (registry, queue) = registry_and_queue().await;
        let worker_id = registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-0-a")
            .await
            .unwrap();

        let checker = HealthChecker::new(registry.clone(), HashMap::new(), Arc::new(FixedClock(Utc::now())));
        checker
            .reclaim_worker(&queue, worker_id, false, "stale heartbeat, process not running")
            .await
            .unwrap();

        let worker = registry.get(worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Dead);
    }
}
