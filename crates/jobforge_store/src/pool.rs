//! Connection pool construction for the two companion SQLite databases
//! (`jobs.db` and `cache.db`, spec §3).
//!
//! Both pools are configured identically: WAL journaling so readers never
//! block the single writer, a generous busy timeout so lock contention
//! waits instead of erroring, and `synchronous = NORMAL` (safe under WAL,
//! and far cheaper than `FULL`).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::error::Result;

/// Connection and pool-sizing options for a job-forge SQLite database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl DbConfig {
    /// A file-backed database at `path`, created if absent.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            url: format!("sqlite:{}", path.as_ref().display()),
            max_connections: 5,
            busy_timeout: Duration::from_secs(30),
        }
    }

    /// An in-memory database, for unit tests. Forced to a single
    /// connection: SQLite's `:memory:` databases are private per
    /// connection, so a pool would silently lose writes.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub async fn connect(&self) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::from_str(&self.url)?
            .create_if_missing(true)
            .busy_timeout(self.busy_timeout)
            .synchronous(SqliteSynchronous::Normal);

        let options = if self.url.contains(":memory:") {
            options
        } else {
            options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(options)
            .await?;

        Ok(pool)
    }
}
