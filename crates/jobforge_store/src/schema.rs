//! CREATE TABLE statements for `jobs.db` and `cache.db` (spec §3, §6).
//!
//! Single source of truth for both schemas. Idempotent: every statement is
//! `IF NOT EXISTS`, so opening an already-migrated database is a no-op.

use sqlx::SqlitePool;

use crate::error::Result;

/// Create the `jobs`, `workers`, `results_cache`, and `workers_events`
/// tables in the pool backing `jobs.db`.
pub async fn ensure_jobs_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            input_file TEXT NOT NULL,
            output_file TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            assigned_worker_id INTEGER,
            error TEXT,
            correlation_id TEXT
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, job_type, priority DESC, id ASC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_worker ON jobs(assigned_worker_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS workers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            worker_type TEXT NOT NULL,
            execution_mode TEXT NOT NULL,
            executor_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'idle',
            last_heartbeat TEXT NOT NULL,
            jobs_processed INTEGER NOT NULL DEFAULT 0,
            jobs_failed INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workers_type_status ON workers(worker_type, status)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS results_cache (
            output_file TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            result_metadata TEXT NOT NULL,
            last_accessed TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (output_file, content_hash)
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS workers_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event TEXT NOT NULL,
            worker_type TEXT,
            detail TEXT,
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the `processed_files`, `processing_issues`, and
/// `executed_notebooks` tables in the pool backing `cache.db`.
pub async fn ensure_cache_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS processed_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            output_metadata TEXT NOT NULL,
            correlation_id TEXT,
            result BLOB NOT NULL,
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processed_files_key \
         ON processed_files(file_path, content_hash, output_metadata, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS processing_issues (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            output_metadata TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processing_issues_key \
         ON processing_issues(file_path, content_hash, output_metadata)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS executed_notebooks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            input_file TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            language TEXT NOT NULL,
            prog_lang TEXT NOT NULL,
            executed_notebook BLOB NOT NULL,
            created_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_executed_notebooks_key \
         ON executed_notebooks(input_file, content_hash, language, prog_lang)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
