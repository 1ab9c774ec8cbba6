//! The durable job queue (`jobs` table) plus the lightweight queue cache
//! (`results_cache` table) that lives alongside it, per spec §4.B.
//!
//! Claiming is a `BEGIN IMMEDIATE` transaction: select the next eligible
//! row, then `UPDATE ... WHERE status = 'pending'` to win the race against
//! any other connection attempting the same claim. A zero-row update means
//! another claimant got there first, and the caller should try again.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;

use jobforge_protocol::job::{Job, JobId, JobStatus, JobType};
use jobforge_protocol::worker::WorkerId;

use crate::error::{Result, StoreError};

pub struct JobQueue {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: i64,
    job_type: String,
    status: String,
    input_file: String,
    output_file: String,
    content_hash: String,
    payload: String,
    priority: i64,
    attempts: i64,
    max_attempts: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    assigned_worker_id: Option<i64>,
    error: Option<String>,
    correlation_id: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            job_type: self
                .job_type
                .parse()
                .map_err(|e| StoreError::invalid_state(format!("{e}")))?,
            status: self
                .status
                .parse()
                .map_err(|e| StoreError::invalid_state(format!("{e}")))?,
            input_file: self.input_file,
            output_file: self.output_file,
            content_hash: self.content_hash,
            payload: serde_json::from_str(&self.payload)?,
            priority: self.priority,
            attempts: self.attempts as i32,
            max_attempts: self.max_attempts as i32,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            assigned_worker_id: self.assigned_worker_id,
            error: self.error,
            correlation_id: self.correlation_id,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, sqlx::FromRow)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl JobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new pending job and return its id.
    pub async fn submit(
        &self,
        job_type: JobType,
        input_file: &str,
        output_file: &str,
        content_hash: &str,
        payload: &Value,
        priority: i64,
        max_attempts: i32,
        correlation_id: Option<&str>,
    ) -> Result<JobId> {
        let now = Utc::now();
        let payload_str = serde_json::to_string(payload)?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO jobs
                (job_type, status, input_file, output_file, content_hash, payload,
                 priority, attempts, max_attempts, created_at, correlation_id)
               VALUES (?, 'pending', ?, ?, ?, ?, ?, 0, ?, ?, ?)
               RETURNING id"#,
        )
        .bind(job_type.as_str())
        .bind(input_file)
        .bind(output_file)
        .bind(content_hash)
        .bind(payload_str)
        .bind(priority)
        .bind(max_attempts as i64)
        .bind(now)
        .bind(correlation_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Atomically claim the highest-priority pending job of `job_type`,
    /// assigning it to `worker_id`. Priority order: `priority DESC, id ASC`
    /// (oldest job wins ties), per spec §4.B / §8.
    pub async fn claim_next(&self, job_type: JobType, worker_id: WorkerId) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let job_id: Option<i64> = sqlx::query_scalar(
            r#"SELECT id FROM jobs
               WHERE status = 'pending' AND job_type = ? AND attempts < max_attempts
               ORDER BY priority DESC, id ASC
               LIMIT 1"#,
        )
        .bind(job_type.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job_id) = job_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = Utc::now();
        let rows_affected = sqlx::query(
            r#"UPDATE jobs
               SET status = 'processing', started_at = ?, assigned_worker_id = ?,
                   attempts = attempts + 1
               WHERE id = ? AND status = 'pending'"#,
        )
        .bind(now)
        .bind(worker_id)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Lost the race to another claimant.
            tx.commit().await?;
            return Ok(None);
        }

        let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(row.into_job()?))
    }

    /// Mark a job completed.
    pub async fn complete(&self, job_id: JobId) -> Result<()> {
        let now = Utc::now();
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ?, error = NULL WHERE id = ?",
        )
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(StoreError::not_found(format!("job {job_id}")));
        }
        Ok(())
    }

    /// Record a job failure. If the job has attempts remaining it is
    /// requeued to `pending` (clearing its worker assignment so it can be
    /// claimed by any worker); otherwise it is marked `failed` terminally.
    pub async fn fail_or_retry(&self, job_id: JobId, error_message: &str) -> Result<JobStatus> {
        let mut tx = self.pool.begin().await?;

        let (attempts, max_attempts): (i64, i64) =
            sqlx::query_as("SELECT attempts, max_attempts FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found(format!("job {job_id}")))?;

        let final_status = if attempts >= max_attempts {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        };

        let now = Utc::now();
        match final_status {
            JobStatus::Failed => {
                sqlx::query(
                    "UPDATE jobs SET status = 'failed', completed_at = ?, error = ? WHERE id = ?",
                )
                .bind(now)
                .bind(error_message)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            }
            JobStatus::Pending => {
                sqlx::query(
                    "UPDATE jobs SET status = 'pending', started_at = NULL, \
                     assigned_worker_id = NULL, error = ? WHERE id = ?",
                )
                .bind(error_message)
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            }
            _ => unreachable!(),
        }

        tx.commit().await?;
        Ok(final_status)
    }

    /// Reset every job that has been `processing` for longer than
    /// `timeout_seconds` back to `pending`, clearing its worker
    /// assignment (spec §4.B `ResetHungJobs`). Returns the number of jobs
    /// reset. Idempotent: a second call with no intervening claims resets
    /// an empty set (spec §8).
    pub async fn reset_hung_jobs(&self, timeout_seconds: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(timeout_seconds);
        let rows = sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL, assigned_worker_id = NULL \
             WHERE status = 'processing' AND started_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Reset every job assigned to `worker_id` that is still `processing`
    /// back into the retry/fail decision in `fail_or_retry`. Used when a
    /// worker is discovered hung or dead (spec §4.F).
    pub async fn reset_jobs_for_worker(&self, worker_id: WorkerId, reason: &str) -> Result<Vec<JobId>> {
        let job_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE assigned_worker_id = ? AND status = 'processing'",
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        for job_id in &job_ids {
            self.fail_or_retry(*job_id, reason).await?;
        }

        Ok(job_ids)
    }

    /// Reset every job stuck `processing` under a worker whose row is
    /// already `dead`, in a single `BEGIN IMMEDIATE` join query (spec
    /// §4.H's "dead-worker job rescue", ~every 5s from `WaitForCompletion`).
    /// Complements `reset_hung_jobs`/`reset_jobs_for_worker`, which act on
    /// a worker discovery already knows is unhealthy; this covers the
    /// gap where a worker died and was marked dead between polls.
    pub async fn reset_jobs_of_dead_workers(&self) -> Result<Vec<JobId>> {
        let mut tx = self.pool.begin().await?;

        let job_ids: Vec<i64> = sqlx::query_scalar(
            r#"SELECT j.id FROM jobs j
               INNER JOIN workers w ON j.assigned_worker_id = w.id
               WHERE j.status = 'processing' AND w.status = 'dead'"#,
        )
        .fetch_all(&mut *tx)
        .await?;

        if job_ids.is_empty() {
            tx.commit().await?;
            return Ok(job_ids);
        }

        sqlx::query(
            r#"UPDATE jobs SET status = 'pending', started_at = NULL, assigned_worker_id = NULL
               WHERE id IN (
                   SELECT j.id FROM jobs j
                   INNER JOIN workers w ON j.assigned_worker_id = w.id
                   WHERE j.status = 'processing' AND w.status = 'dead'
               )"#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job_ids)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job> {
        let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("job {job_id}")))?;
        row.into_job()
    }

    pub async fn jobs_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM jobs WHERE status = ? ORDER BY id ASC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let stats: QueueStats = sqlx::query_as(
            r#"SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
               FROM jobs"#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    pub async fn stats_by_type(&self, job_type: JobType) -> Result<QueueStats> {
        let stats: QueueStats = sqlx::query_as(
            r#"SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'completed') as completed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
               FROM jobs WHERE job_type = ?"#,
        )
        .bind(job_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }

    /// Delete terminal jobs older than `older_than`. Returns the number of
    /// rows removed.
    pub async fn clear_old_completed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND completed_at < ?",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Look up the queue cache (`results_cache`) for a previously-produced
    /// output, bumping its access bookkeeping on a hit.
    pub async fn check_cache(
        &self,
        output_file: &str,
        content_hash: &str,
    ) -> Result<Option<Value>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> = sqlx::query_as(
            "SELECT result_metadata FROM results_cache WHERE output_file = ? AND content_hash = ?",
        )
        .bind(output_file)
        .bind(content_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((metadata,)) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = Utc::now();
        sqlx::query(
            "UPDATE results_cache SET last_accessed = ?, access_count = access_count + 1 \
             WHERE output_file = ? AND content_hash = ?",
        )
        .bind(now)
        .bind(output_file)
        .bind(content_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(serde_json::from_str(&metadata)?))
    }

    /// Record a freshly-produced output in the queue cache.
    pub async fn store_cache(
        &self,
        output_file: &str,
        content_hash: &str,
        result_metadata: &Value,
    ) -> Result<()> {
        let now = Utc::now();
        let metadata_str = serde_json::to_string(result_metadata)?;

        sqlx::query(
            r#"INSERT INTO results_cache (output_file, content_hash, result_metadata, last_accessed, access_count)
               VALUES (?, ?, ?, ?, 1)
               ON CONFLICT(output_file, content_hash) DO UPDATE SET
                   result_metadata = excluded.result_metadata,
                   last_accessed = excluded.last_accessed,
                   access_count = results_cache.access_count + 1"#,
        )
        .bind(output_file)
        .bind(content_hash)
        .bind(metadata_str)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use crate::schema::ensure_jobs_schema;

    async fn setup() -> JobQueue {
        let pool = DbConfig::memory().connect().await.unwrap();
        ensure_jobs_schema(&pool).await.unwrap();
        JobQueue::new(pool)
    }

    #[tokio::test]
    async fn claim_next_returns_none_on_empty_queue() {
        let queue = setup().await;
        assert!(queue.claim_next(JobType::Notebook, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_next_respects_priority_then_fifo() {
        let queue = setup().await;
        queue
            .submit(JobType::Notebook, "a", "a.out", "h", &Value::Null, 0, 3, None)
            .await
            .unwrap();
        let high_id = queue
            .submit(JobType::Notebook, "b", "b.out", "h", &Value::Null, 10, 3, None)
            .await
            .unwrap();

        let claimed = queue.claim_next(JobType::Notebook, 1).await.unwrap().unwrap();
        assert_eq!(claimed.id, high_id);
    }

    #[tokio::test]
    async fn claim_next_never_returns_a_job_reset_past_its_attempt_bound() {
        let queue = setup().await;
        let id = queue
            .submit(JobType::Notebook, "a", "a.out", "h", &Value::Null, 0, 1, None)
            .await
            .unwrap();

        queue.claim_next(JobType::Notebook, 1).await.unwrap();
        // `reset_hung_jobs` requeues straight to pending without touching
        // `attempts`, mirroring the dead-worker/hung-worker reset paths
        // that never go through `fail_or_retry`.
        assert_eq!(queue.reset_hung_jobs(0).await.unwrap(), 1);

        let job = queue.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);

        assert!(queue.claim_next(JobType::Notebook, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_next_does_not_return_other_job_types() {
        let queue = setup().await;
        queue
            .submit(JobType::PlantUml, "a", "a.out", "h", &Value::Null, 0, 3, None)
            .await
            .unwrap();
        assert!(queue.claim_next(JobType::Notebook, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_or_retry_requeues_until_attempts_exhausted() {
        let queue = setup().await;
        let id = queue
            .submit(JobType::Notebook, "a", "a.out", "h", &Value::Null, 0, 2, None)
            .await
            .unwrap();

        queue.claim_next(JobType::Notebook, 1).await.unwrap();
        let status = queue.fail_or_retry(id, "boom").await.unwrap();
        assert_eq!(status, JobStatus::Pending);

        queue.claim_next(JobType::Notebook, 1).await.unwrap();
        let status = queue.fail_or_retry(id, "boom again").await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let job = queue.get(id).await.unwrap();
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn queue_cache_roundtrips_and_bumps_access_count() {
        let queue = setup().await;
        assert!(queue.check_cache("out.html", "h1").await.unwrap().is_none());

        queue
            .store_cache("out.html", "h1", &serde_json::json!({"size": 10}))
            .await
            .unwrap();
        let hit = queue.check_cache("out.html", "h1").await.unwrap();
        assert_eq!(hit.unwrap()["size"], 10);
    }

    #[tokio::test]
    async fn reset_hung_jobs_is_idempotent() {
        let queue = setup().await;
        let id = queue
            .submit(JobType::Notebook, "a", "a.out", "h", &Value::Null, 0, 3, None)
            .await
            .unwrap();
        queue.claim_next(JobType::Notebook, 1).await.unwrap();

        // started_at is "now", so a 0s timeout treats it as hung.
        let reset_first = queue.reset_hung_jobs(0).await.unwrap();
        assert_eq!(reset_first, 1);

        let job = queue.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.assigned_worker_id.is_none());

        let reset_second = queue.reset_hung_jobs(0).await.unwrap();
        assert_eq!(reset_second, 0);
    }

    #[tokio::test]
    async fn reset_jobs_of_dead_workers_only_touches_dead_joins() {
        // `JobQueue` doesn't expose its pool, so build both the queue and a
        // `WorkerRegistry` over the same fresh in-memory pool directly.
        let shared_pool = crate::pool::DbConfig::memory().connect().await.unwrap();
        ensure_jobs_schema(&shared_pool).await.unwrap();
        let queue = JobQueue::new(shared_pool.clone());
        let registry = crate::worker_registry::WorkerRegistry::new(shared_pool.clone());

        let alive = registry
            .register("notebook", jobforge_protocol::worker::ExecutionMode::Direct, "direct-notebook-0-a")
            .await
            .unwrap();
        let dead = registry
            .register("notebook", jobforge_protocol::worker::ExecutionMode::Direct, "direct-notebook-1-b")
            .await
            .unwrap();
        registry.mark_dead(dead).await.unwrap();

        let kept = queue
            .submit(JobType::Notebook, "a", "a.out", "h", &Value::Null, 0, 3, None)
            .await
            .unwrap();
        let rescued = queue
            .submit(JobType::Notebook, "b", "b.out", "h", &Value::Null, 0, 3, None)
            .await
            .unwrap();

        sqlx::query("UPDATE jobs SET status = 'processing', assigned_worker_id = ? WHERE id = ?")
            .bind(alive)
            .bind(kept)
            .execute(&shared_pool)
            .await
            .unwrap();
        sqlx::query("UPDATE jobs SET status = 'processing', assigned_worker_id = ? WHERE id = ?")
            .bind(dead)
            .bind(rescued)
            .execute(&shared_pool)
            .await
            .unwrap();

        let reset = queue.reset_jobs_of_dead_workers().await.unwrap();
        assert_eq!(reset, vec![rescued]);

        let kept_job = queue.get(kept).await.unwrap();
        assert_eq!(kept_job.status, JobStatus::Processing);
        let rescued_job = queue.get(rescued).await.unwrap();
        assert_eq!(rescued_job.status, JobStatus::Pending);
        assert!(rescued_job.assigned_worker_id.is_none());
    }

    #[tokio::test]
    async fn reset_jobs_for_worker_only_touches_processing_jobs() {
        let queue = setup().await;
        let id = queue
            .submit(JobType::Notebook, "a", "a.out", "h", &Value::Null, 0, 3, None)
            .await
            .unwrap();
        queue.claim_next(JobType::Notebook, 7).await.unwrap();

        let reset = queue.reset_jobs_for_worker(7, "worker hung").await.unwrap();
        assert_eq!(reset, vec![id]);

        let job = queue.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.assigned_worker_id.is_none());
    }
}
