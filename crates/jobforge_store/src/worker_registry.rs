//! The `workers` table: registration, heartbeats, and status transitions
//! for the discovery and health layer (spec §4.F).

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use jobforge_protocol::worker::{ExecutionMode, Worker, WorkerId, WorkerStatus};

use crate::error::{Result, StoreError};

pub struct WorkerRegistry {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct WorkerRow {
    id: i64,
    worker_type: String,
    execution_mode: String,
    executor_id: String,
    status: String,
    last_heartbeat: DateTime<Utc>,
    jobs_processed: i64,
    jobs_failed: i64,
    started_at: DateTime<Utc>,
}

impl WorkerRow {
    fn into_worker(self) -> Result<Worker> {
        Ok(Worker {
            id: self.id,
            worker_type: self.worker_type,
            execution_mode: self
                .execution_mode
                .parse()
                .map_err(|e| StoreError::invalid_state(format!("{e}")))?,
            executor_id: self.executor_id,
            status: self
                .status
                .parse()
                .map_err(|e| StoreError::invalid_state(format!("{e}")))?,
            last_heartbeat: self.last_heartbeat,
            jobs_processed: self.jobs_processed,
            jobs_failed: self.jobs_failed,
            started_at: self.started_at,
        })
    }
}

impl WorkerRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a newly-started worker process, returning its row id.
    pub async fn register(
        &self,
        worker_type: &str,
        execution_mode: ExecutionMode,
        executor_id: &str,
    ) -> Result<WorkerId> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO workers
                (worker_type, execution_mode, executor_id, status, last_heartbeat, started_at)
               VALUES (?, ?, ?, 'idle', ?, ?)
               RETURNING id"#,
        )
        .bind(worker_type)
        .bind(execution_mode.as_str())
        .bind(executor_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn heartbeat(&self, worker_id: WorkerId) -> Result<()> {
        let now = Utc::now();
        let rows = sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE id = ?")
            .bind(now)
            .bind(worker_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(StoreError::not_found(format!("worker {worker_id}")));
        }
        Ok(())
    }

    pub async fn set_status(&self, worker_id: WorkerId, status: WorkerStatus) -> Result<()> {
        sqlx::query("UPDATE workers SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a completed job outcome for pool-manager-level stats.
    pub async fn record_outcome(&self, worker_id: WorkerId, succeeded: bool) -> Result<()> {
        if succeeded {
            sqlx::query("UPDATE workers SET jobs_processed = jobs_processed + 1, status = 'idle' WHERE id = ?")
                .bind(worker_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(
                "UPDATE workers SET jobs_processed = jobs_processed + 1, jobs_failed = jobs_failed + 1, status = 'idle' WHERE id = ?",
            )
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn mark_dead(&self, worker_id: WorkerId) -> Result<()> {
        self.set_status(worker_id, WorkerStatus::Dead).await
    }

    pub async fn delete(&self, worker_id: WorkerId) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, worker_id: WorkerId) -> Result<Worker> {
        let row: WorkerRow = sqlx::query_as("SELECT * FROM workers WHERE id = ?")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("worker {worker_id}")))?;
        row.into_worker()
    }

    /// Look up a worker by its executor id, used while waiting for a
    /// freshly-launched worker to self-register (spec §4.E).
    pub async fn get_by_executor_id(&self, executor_id: &str) -> Result<Option<Worker>> {
        let row: Option<WorkerRow> = sqlx::query_as("SELECT * FROM workers WHERE executor_id = ?")
            .bind(executor_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(WorkerRow::into_worker).transpose()
    }

    /// All workers of any type/status (used by discovery's full sweep).
    pub async fn list(&self) -> Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as("SELECT * FROM workers ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(WorkerRow::into_worker).collect()
    }

    /// Workers of `worker_type` whose status is a candidate for health
    /// classification (`Idle` or `Busy`; spec §4.F).
    pub async fn discover(&self, worker_type: &str) -> Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            "SELECT * FROM workers WHERE worker_type = ? AND status IN ('idle', 'busy') ORDER BY id ASC",
        )
        .bind(worker_type)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WorkerRow::into_worker).collect()
    }

    pub async fn count_healthy(&self, worker_type: &str, stale_before: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workers WHERE worker_type = ? AND status IN ('idle', 'busy') AND last_heartbeat >= ?",
        )
        .bind(worker_type)
        .bind(stale_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use crate::schema::ensure_jobs_schema;

    async fn setup() -> WorkerRegistry {
        let pool = DbConfig::memory().connect().await.unwrap();
        ensure_jobs_schema(&pool).await.unwrap();
        WorkerRegistry::new(pool)
    }

    #[tokio::test]
    async fn register_then_get_roundtrips() {
        let registry = setup().await;
        let id = registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-0-ab12cd34")
            .await
            .unwrap();
        let worker = registry.get(id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.execution_mode, ExecutionMode::Direct);
    }

    #[tokio::test]
    async fn discover_excludes_hung_and_dead() {
        let registry = setup().await;
        let idle = registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-0-a")
            .await
            .unwrap();
        let hung = registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-1-b")
            .await
            .unwrap();
        registry.set_status(hung, WorkerStatus::Hung).await.unwrap();

        let discovered = registry.discover("notebook").await.unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].id, idle);
    }

    #[tokio::test]
    async fn count_healthy_excludes_stale_heartbeats() {
        let registry = setup().await;
        registry
            .register("notebook", ExecutionMode::Direct, "direct-notebook-0-a")
            .await
            .unwrap();

        let future_cutoff = Utc::now() + chrono::Duration::seconds(3600);
        assert_eq!(
            registry.count_healthy("notebook", future_cutoff).await.unwrap(),
            0
        );
        assert_eq!(
            registry
                .count_healthy("notebook", Utc::now() - chrono::Duration::seconds(60))
                .await
                .unwrap(),
            1
        );
    }
}
