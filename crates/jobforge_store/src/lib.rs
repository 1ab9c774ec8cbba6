//! Durable SQLite-backed storage for the Job Forge job-processing
//! substrate: the job queue, the worker registry, and the two result
//! caches that sit in front of it (spec §3, §4.A–C).
//!
//! Two independent databases are opened side by side: `jobs.db` (jobs,
//! workers, the lightweight queue cache, and the lifecycle audit log) and
//! `cache.db` (the content-addressed artifact cache, the issue log, and
//! the executed-notebook intermediate cache). Splitting them keeps the
//! high-churn queue traffic off the same WAL as the comparatively large
//! artifact blobs.

pub mod error;
pub mod events;
pub mod issue_log;
pub mod notebook_cache;
pub mod pool;
pub mod queue;
pub mod result_cache;
pub mod schema;
pub mod worker_registry;

pub use error::{Result, StoreError};
pub use events::WorkerEventLogger;
pub use issue_log::IssueLog;
pub use notebook_cache::NotebookCache;
pub use pool::DbConfig;
pub use queue::{JobQueue, QueueStats};
pub use result_cache::{CacheStats, ResultCache};
pub use worker_registry::WorkerRegistry;

use sqlx::SqlitePool;

/// Handle to the `jobs.db` database: queue, worker registry, queue cache,
/// and event log, all sharing one connection pool.
#[derive(Clone)]
pub struct JobsDb {
    pub queue: std::sync::Arc<JobQueue>,
    pub workers: std::sync::Arc<WorkerRegistry>,
    pub events: std::sync::Arc<WorkerEventLogger>,
    pool: SqlitePool,
}

impl JobsDb {
    pub async fn open(config: &DbConfig) -> Result<Self> {
        let pool = config.connect().await?;
        schema::ensure_jobs_schema(&pool).await?;
        Ok(Self {
            queue: std::sync::Arc::new(JobQueue::new(pool.clone())),
            workers: std::sync::Arc::new(WorkerRegistry::new(pool.clone())),
            events: std::sync::Arc::new(WorkerEventLogger::new(pool.clone())),
            pool,
        })
    }

    /// Reset every job still `processing` under a worker that no longer
    /// passes the health check (spec §4.F / §8's hung-reset idempotence
    /// property: calling this twice in a row with no intervening claims is
    /// a no-op the second time).
    pub async fn reclaim_jobs_for_dead_worker(
        &self,
        worker_id: jobforge_protocol::worker::WorkerId,
        reason: &str,
    ) -> Result<Vec<jobforge_protocol::job::JobId>> {
        self.queue.reset_jobs_for_worker(worker_id, reason).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Handle to the `cache.db` database: artifact cache, issue log, and
/// notebook intermediate cache, sharing one connection pool.
#[derive(Clone)]
pub struct CacheDb {
    pub results: std::sync::Arc<ResultCache>,
    pub issues: std::sync::Arc<IssueLog>,
    pub notebooks: std::sync::Arc<NotebookCache>,
    pool: SqlitePool,
}

impl CacheDb {
    pub async fn open(config: &DbConfig) -> Result<Self> {
        let pool = config.connect().await?;
        schema::ensure_cache_schema(&pool).await?;
        Ok(Self {
            results: std::sync::Arc::new(ResultCache::new(pool.clone())),
            issues: std::sync::Arc::new(IssueLog::new(pool.clone())),
            notebooks: std::sync::Arc::new(NotebookCache::new(pool.clone())),
            pool,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_db_open_is_idempotent() {
        let config = DbConfig::memory();
        let db = JobsDb::open(&config).await.unwrap();
        // Re-running schema creation against the same pool must not fail.
        schema::ensure_jobs_schema(db.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn cache_db_open_is_idempotent() {
        let config = DbConfig::memory();
        let db = CacheDb::open(&config).await.unwrap();
        schema::ensure_cache_schema(db.pool()).await.unwrap();
    }
}
