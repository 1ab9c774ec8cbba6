//! The content-addressed artifact cache (`cache.db`'s `processed_files`
//! table), spec §4.C.
//!
//! Multiple rows may share a `(file_path, content_hash, output_metadata)`
//! key across re-runs; lookups always return the newest. `prune_old_versions`
//! is the only place older rows are ever deleted, keeping the cache from
//! growing unboundedly when a file is processed repeatedly.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use jobforge_protocol::cache::ResultCacheRow;

use crate::error::Result;

pub struct ResultCache {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    file_path: String,
    content_hash: String,
    output_metadata: String,
    correlation_id: Option<String>,
    result: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl From<ResultRow> for ResultCacheRow {
    fn from(row: ResultRow) -> Self {
        ResultCacheRow {
            file_path: row.file_path,
            content_hash: row.content_hash,
            output_metadata: row.output_metadata,
            correlation_id: row.correlation_id,
            result: row.result,
            created_at: row.created_at,
        }
    }
}

impl ResultCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn store(&self, row: &ResultCacheRow) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO processed_files
                (file_path, content_hash, output_metadata, correlation_id, result, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&row.file_path)
        .bind(&row.content_hash)
        .bind(&row.output_metadata)
        .bind(&row.correlation_id)
        .bind(&row.result)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Look up the newest artifact for this key, if any.
    pub async fn get(
        &self,
        file_path: &str,
        content_hash: &str,
        output_metadata: &str,
    ) -> Result<Option<ResultCacheRow>> {
        let row: Option<ResultRow> = sqlx::query_as(
            r#"SELECT file_path, content_hash, output_metadata, correlation_id, result, created_at
               FROM processed_files
               WHERE file_path = ? AND content_hash = ? AND output_metadata = ?
               ORDER BY created_at DESC
               LIMIT 1"#,
        )
        .bind(file_path)
        .bind(content_hash)
        .bind(output_metadata)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Store a new artifact and immediately prune older rows for the
    /// same key, keeping only the `retain_count` most recent (spec
    /// §4.C's `StoreLatest`).
    pub async fn store_latest(&self, row: &ResultCacheRow, retain_count: i64) -> Result<()> {
        self.store(row).await?;
        self.prune_key_to(
            &row.file_path,
            &row.content_hash,
            &row.output_metadata,
            retain_count,
        )
        .await?;
        Ok(())
    }

    async fn prune_key_to(
        &self,
        file_path: &str,
        content_hash: &str,
        output_metadata: &str,
        retain_count: i64,
    ) -> Result<u64> {
        let rows = sqlx::query(
            r#"DELETE FROM processed_files
               WHERE file_path = ? AND content_hash = ? AND output_metadata = ?
               AND id NOT IN (
                   SELECT id FROM processed_files
                   WHERE file_path = ? AND content_hash = ? AND output_metadata = ?
                   ORDER BY created_at DESC LIMIT ?
               )"#,
        )
        .bind(file_path)
        .bind(content_hash)
        .bind(output_metadata)
        .bind(file_path)
        .bind(content_hash)
        .bind(output_metadata)
        .bind(retain_count)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Keep only the `retain_count` most recent rows for *every*
    /// `(file_path, output_metadata)` pair across the whole table, using
    /// a windowed rank rather than one DELETE per key (spec §4.C
    /// Maintenance).
    pub async fn prune_all_old_versions(&self, retain_count: i64) -> Result<u64> {
        let rows = sqlx::query(
            r#"DELETE FROM processed_files
               WHERE id IN (
                   SELECT id FROM (
                       SELECT id, ROW_NUMBER() OVER (
                           PARTITION BY file_path, output_metadata
                           ORDER BY created_at DESC
                       ) AS rn
                       FROM processed_files
                   )
                   WHERE rn > ?
               )"#,
        )
        .bind(retain_count)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Delete every row for this key except the newest, so repeated
    /// reprocessing of an unchanged input doesn't accumulate duplicate
    /// blobs.
    pub async fn prune_old_versions(
        &self,
        file_path: &str,
        content_hash: &str,
        output_metadata: &str,
    ) -> Result<u64> {
        let rows = sqlx::query(
            r#"DELETE FROM processed_files
               WHERE file_path = ? AND content_hash = ? AND output_metadata = ?
               AND id NOT IN (
                   SELECT id FROM processed_files
                   WHERE file_path = ? AND content_hash = ? AND output_metadata = ?
                   ORDER BY created_at DESC LIMIT 1
               )"#,
        )
        .bind(file_path)
        .bind(content_hash)
        .bind(output_metadata)
        .bind(file_path)
        .bind(content_hash)
        .bind(output_metadata)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows)
    }

    /// Compact the database file after a bulk prune. Cheap no-op if there's
    /// nothing to reclaim; `VACUUM` requires no open transaction.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let stats: CacheStats = sqlx::query_as(
            "SELECT COUNT(*) as total_rows, COUNT(DISTINCT file_path) as distinct_files, \
             COALESCE(SUM(LENGTH(result)), 0) as total_bytes FROM processed_files",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }
}

#[derive(Debug, Default, sqlx::FromRow)]
pub struct CacheStats {
    pub total_rows: i64,
    pub distinct_files: i64,
    pub total_bytes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use crate::schema::ensure_cache_schema;

    async fn setup() -> ResultCache {
        let pool = DbConfig::memory().connect().await.unwrap();
        ensure_cache_schema(&pool).await.unwrap();
        ResultCache::new(pool)
    }

    fn row(created_at: DateTime<Utc>) -> ResultCacheRow {
        ResultCacheRow {
            file_path: "slides/in.ipynb".to_string(),
            content_hash: "abc123".to_string(),
            output_metadata: "speaker/python/en".to_string(),
            correlation_id: None,
            result: b"<html></html>".to_vec(),
            created_at,
        }
    }

    #[tokio::test]
    async fn get_returns_none_before_any_store() {
        let cache = setup().await;
        assert!(cache
            .get("slides/in.ipynb", "abc123", "speaker/python/en")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn get_returns_newest_among_duplicates() {
        let cache = setup().await;
        let older = row(Utc::now() - chrono::Duration::seconds(60));
        let mut newer = row(Utc::now());
        newer.result = b"<html>v2</html>".to_vec();

        cache.store(&older).await.unwrap();
        cache.store(&newer).await.unwrap();

        let hit = cache
            .get("slides/in.ipynb", "abc123", "speaker/python/en")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.result, b"<html>v2</html>");
    }

    #[tokio::test]
    async fn store_latest_prunes_older_rows_for_the_same_key() {
        let cache = setup().await;
        cache
            .store_latest(&row(Utc::now() - chrono::Duration::seconds(120)), 2)
            .await
            .unwrap();
        cache
            .store_latest(&row(Utc::now() - chrono::Duration::seconds(60)), 2)
            .await
            .unwrap();
        cache.store_latest(&row(Utc::now()), 2).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_rows, 2);
    }

    #[tokio::test]
    async fn prune_all_old_versions_keeps_retain_count_per_key_across_store() {
        let cache = setup().await;
        for i in 0..5 {
            cache
                .store(&row(Utc::now() - chrono::Duration::seconds(i)))
                .await
                .unwrap();
        }

        let pruned = cache.prune_all_old_versions(2).await.unwrap();
        assert_eq!(pruned, 3);
        assert_eq!(cache.stats().await.unwrap().total_rows, 2);
    }

    #[tokio::test]
    async fn prune_old_versions_keeps_only_newest() {
        let cache = setup().await;
        cache.store(&row(Utc::now() - chrono::Duration::seconds(120))).await.unwrap();
        cache.store(&row(Utc::now() - chrono::Duration::seconds(60))).await.unwrap();
        cache.store(&row(Utc::now())).await.unwrap();

        let pruned = cache
            .prune_old_versions("slides/in.ipynb", "abc123", "speaker/python/en")
            .await
            .unwrap();
        assert_eq!(pruned, 2);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_rows, 1);
    }
}
