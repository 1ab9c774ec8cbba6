//! The issue log (`cache.db`'s `processing_issues` table), spec §4.C / §7.
//!
//! Lets a cache hit still surface the errors and warnings that were
//! produced the first time a (file, hash, output) key was processed,
//! rather than silently reporting success.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use jobforge_protocol::cache::{IssueKind, IssueRow};

use crate::error::Result;

pub struct IssueLog {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct IssueRecord {
    file_path: String,
    content_hash: String,
    output_metadata: String,
    kind: String,
    payload: String,
    created_at: DateTime<Utc>,
}

impl IssueRecord {
    fn into_issue(self) -> Result<IssueRow> {
        let kind = match self.kind.as_str() {
            "error" => IssueKind::Error,
            _ => IssueKind::Warning,
        };
        Ok(IssueRow {
            file_path: self.file_path,
            content_hash: self.content_hash,
            output_metadata: self.output_metadata,
            kind,
            payload: self.payload,
            created_at: self.created_at,
        })
    }
}

impl IssueLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn store(&self, row: &IssueRow) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO processing_issues
                (file_path, content_hash, output_metadata, kind, payload, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&row.file_path)
        .bind(&row.content_hash)
        .bind(&row.output_metadata)
        .bind(row.kind.as_str())
        .bind(&row.payload)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store an error, idempotently: existing `kind = 'error'` rows for
    /// this key are deleted first, so a cache hit never re-surfaces a
    /// stale error alongside the fresh one (spec §4.C).
    pub async fn store_error(&self, row: &IssueRow) -> Result<()> {
        sqlx::query(
            "DELETE FROM processing_issues \
             WHERE file_path = ? AND content_hash = ? AND output_metadata = ? AND kind = 'error'",
        )
        .bind(&row.file_path)
        .bind(&row.content_hash)
        .bind(&row.output_metadata)
        .execute(&self.pool)
        .await?;

        self.store(row).await
    }

    /// Store a warning. Warnings accumulate across runs, unlike errors.
    pub async fn store_warning(&self, row: &IssueRow) -> Result<()> {
        self.store(row).await
    }

    pub async fn get_issues(
        &self,
        file_path: &str,
        content_hash: &str,
        output_metadata: &str,
    ) -> Result<Vec<IssueRow>> {
        let rows: Vec<IssueRecord> = sqlx::query_as(
            r#"SELECT file_path, content_hash, output_metadata, kind, payload, created_at
               FROM processing_issues
               WHERE file_path = ? AND content_hash = ? AND output_metadata = ?
               ORDER BY created_at ASC"#,
        )
        .bind(file_path)
        .bind(content_hash)
        .bind(output_metadata)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IssueRecord::into_issue).collect()
    }

    pub async fn clear_issues(
        &self,
        file_path: &str,
        content_hash: &str,
        output_metadata: &str,
    ) -> Result<u64> {
        let rows = sqlx::query(
            "DELETE FROM processing_issues WHERE file_path = ? AND content_hash = ? AND output_metadata = ?",
        )
        .bind(file_path)
        .bind(content_hash)
        .bind(output_metadata)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows)
    }

    pub async fn prune_old_issues(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM processing_issues WHERE created_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use crate::schema::ensure_cache_schema;

    async fn setup() -> IssueLog {
        let pool = DbConfig::memory().connect().await.unwrap();
        ensure_cache_schema(&pool).await.unwrap();
        IssueLog::new(pool)
    }

    fn warning() -> IssueRow {
        IssueRow {
            file_path: "slides/in.ipynb".to_string(),
            content_hash: "abc".to_string(),
            output_metadata: "speaker/python/en".to_string(),
            kind: IssueKind::Warning,
            payload: r#"{"message":"slow cell"}"#.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn issues_roundtrip_in_creation_order() {
        let log = setup().await;
        log.store(&warning()).await.unwrap();

        let mut second = warning();
        second.payload = r#"{"message":"second"}"#.to_string();
        log.store(&second).await.unwrap();

        let issues = log
            .get_issues("slides/in.ipynb", "abc", "speaker/python/en")
            .await
            .unwrap();
        assert_eq!(issues.len(), 2);
        assert!(issues[0].payload.contains("slow cell"));
    }

    #[tokio::test]
    async fn store_error_replaces_prior_error_but_keeps_warnings() {
        let log = setup().await;
        log.store(&warning()).await.unwrap();

        let mut first_error = warning();
        first_error.kind = IssueKind::Error;
        first_error.payload = r#"{"message":"first failure"}"#.to_string();
        log.store_error(&first_error).await.unwrap();

        let mut second_error = first_error.clone();
        second_error.payload = r#"{"message":"second failure"}"#.to_string();
        log.store_error(&second_error).await.unwrap();

        let issues = log
            .get_issues("slides/in.ipynb", "abc", "speaker/python/en")
            .await
            .unwrap();
        let errors: Vec<_> = issues.iter().filter(|i| i.kind == IssueKind::Error).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].payload.contains("second failure"));
        assert_eq!(issues.iter().filter(|i| i.kind == IssueKind::Warning).count(), 1);
    }

    #[tokio::test]
    async fn clear_issues_removes_only_matching_key() {
        let log = setup().await;
        log.store(&warning()).await.unwrap();

        let cleared = log
            .clear_issues("slides/in.ipynb", "abc", "speaker/python/en")
            .await
            .unwrap();
        assert_eq!(cleared, 1);

        let issues = log
            .get_issues("slides/in.ipynb", "abc", "speaker/python/en")
            .await
            .unwrap();
        assert!(issues.is_empty());
    }
}
