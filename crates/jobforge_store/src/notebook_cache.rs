//! The executed-notebook intermediate cache (`cache.db`'s
//! `executed_notebooks` table), spec §4.C.
//!
//! Keyed on `(input_file, content_hash, language, prog_lang)` —
//! deliberately without `output_metadata`, since the speaker-notes variant
//! and the completed-code variant of the same notebook share one executed
//! intermediate (see `jobforge_protocol::hashing`). A miss here is a typed
//! "not cached", distinct from an execution failure; callers that disable
//! fallback execution must be able to tell the two apart.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::Result;

pub struct NotebookCache {
    pool: SqlitePool,
}

impl NotebookCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        input_file: &str,
        content_hash: &str,
        language: &str,
        prog_lang: &str,
    ) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"SELECT executed_notebook FROM executed_notebooks
               WHERE input_file = ? AND content_hash = ? AND language = ? AND prog_lang = ?"#,
        )
        .bind(input_file)
        .bind(content_hash)
        .bind(language)
        .bind(prog_lang)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(bytes,)| bytes))
    }

    /// Store (or, on key collision from a concurrent executor, silently
    /// keep the existing row) the executed intermediate.
    pub async fn store(
        &self,
        input_file: &str,
        content_hash: &str,
        language: &str,
        prog_lang: &str,
        executed_notebook: &[u8],
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO executed_notebooks
                (input_file, content_hash, language, prog_lang, executed_notebook, created_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(input_file, content_hash, language, prog_lang) DO NOTHING"#,
        )
        .bind(input_file)
        .bind(content_hash)
        .bind(language)
        .bind(prog_lang)
        .bind(executed_notebook)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn prune_older_than(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM executed_notebooks WHERE created_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    /// Delete every row whose `content_hash` is not in `valid_hashes`
    /// (spec §4.C Maintenance: "keep only rows whose content_hash is in a
    /// supplied valid set"). Used when a driver knows the full set of
    /// hashes still reachable from the current source tree and wants to
    /// drop everything else in one pass, rather than aging rows out by
    /// time.
    pub async fn prune_not_in(&self, valid_hashes: &[String]) -> Result<u64> {
        if valid_hashes.is_empty() {
            let rows = sqlx::query("DELETE FROM executed_notebooks")
                .execute(&self.pool)
                .await?
                .rows_affected();
            return Ok(rows);
        }

        let placeholders = valid_hashes.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!("DELETE FROM executed_notebooks WHERE content_hash NOT IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for hash in valid_hashes {
            query = query.bind(hash);
        }
        let rows = query.execute(&self.pool).await?.rows_affected();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use crate::schema::ensure_cache_schema;

    async fn setup() -> NotebookCache {
        let pool = DbConfig::memory().connect().await.unwrap();
        ensure_cache_schema(&pool).await.unwrap();
        NotebookCache::new(pool)
    }

    #[tokio::test]
    async fn miss_is_typed_none_not_an_error() {
        let cache = setup().await;
        assert!(cache.get("in.ipynb", "abc", "en", "python").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_then_get_roundtrips() {
        let cache = setup().await;
        cache
            .store("in.ipynb", "abc", "en", "python", b"{\"cells\": []}")
            .await
            .unwrap();
        let hit = cache.get("in.ipynb", "abc", "en", "python").await.unwrap();
        assert_eq!(hit.unwrap(), b"{\"cells\": []}");
    }

    #[tokio::test]
    async fn prune_not_in_keeps_only_the_supplied_hashes() {
        let cache = setup().await;
        cache.store("a.ipynb", "keep-me", "en", "python", b"a").await.unwrap();
        cache.store("b.ipynb", "drop-me", "en", "python", b"b").await.unwrap();

        let pruned = cache.prune_not_in(&["keep-me".to_string()]).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(cache.get("a.ipynb", "keep-me", "en", "python").await.unwrap().is_some());
        assert!(cache.get("b.ipynb", "drop-me", "en", "python").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_not_in_empty_set_drops_everything() {
        let cache = setup().await;
        cache.store("a.ipynb", "h1", "en", "python", b"a").await.unwrap();
        let pruned = cache.prune_not_in(&[]).await.unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn shared_across_output_metadata_variants() {
        // Two different output variants (speaker notes vs completed code)
        // of the same input/language/prog_lang share one cache row, since
        // output_metadata plays no part in this key.
        let cache = setup().await;
        cache
            .store("in.ipynb", "abc", "en", "python", b"executed-once")
            .await
            .unwrap();
        cache
            .store("in.ipynb", "abc", "en", "python", b"executed-twice")
            .await
            .unwrap();

        let hit = cache.get("in.ipynb", "abc", "en", "python").await.unwrap();
        assert_eq!(hit.unwrap(), b"executed-once");
    }
}
