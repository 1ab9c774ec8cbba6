//! The pool lifecycle audit trail (`jobs.db`'s `workers_events` table).
//!
//! Separate from `tracing` output: this is a queryable record a driver can
//! replay (e.g. "when did the notebook pool last restart?"), not just a
//! log line.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

pub struct WorkerEventLogger {
    pool: SqlitePool,
}

impl WorkerEventLogger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn log(&self, event: &str, worker_type: Option<&str>, detail: Option<&str>) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO workers_events (event, worker_type, detail, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(event)
        .bind(worker_type)
        .bind(detail)
        .bind(now)
        .execute(&self.pool)
        .await?;
        info!(event, worker_type, detail, "pool lifecycle event");
        Ok(())
    }

    pub async fn pool_starting(&self, worker_type: &str, count: usize) -> Result<()> {
        self.log("pool_starting", Some(worker_type), Some(&count.to_string()))
            .await
    }

    pub async fn pool_started(&self, worker_type: &str, count: usize) -> Result<()> {
        self.log("pool_started", Some(worker_type), Some(&count.to_string()))
            .await
    }

    pub async fn pool_stopping(&self, worker_type: &str) -> Result<()> {
        self.log("pool_stopping", Some(worker_type), None).await
    }

    pub async fn pool_stopped(&self, worker_type: &str) -> Result<()> {
        self.log("pool_stopped", Some(worker_type), None).await
    }

    pub async fn worker_marked_hung(&self, worker_type: &str, executor_id: &str) -> Result<()> {
        self.log("worker_marked_hung", Some(worker_type), Some(executor_id))
            .await
    }

    pub async fn worker_marked_dead(&self, worker_type: &str, executor_id: &str) -> Result<()> {
        self.log("worker_marked_dead", Some(worker_type), Some(executor_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use crate::schema::ensure_jobs_schema;

    #[tokio::test]
    async fn logs_are_persisted() {
        let pool = DbConfig::memory().connect().await.unwrap();
        ensure_jobs_schema(&pool).await.unwrap();
        let logger = WorkerEventLogger::new(pool.clone());

        logger.pool_starting("notebook", 3).await.unwrap();
        logger.pool_started("notebook", 3).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workers_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
