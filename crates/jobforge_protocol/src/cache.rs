//! Cache row types for the artifact cache, issue log, and the lightweight
//! queue cache (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row in the content-addressed artifact cache (`cache.db`'s
/// `processed_files` table). Multiple rows may share
/// `(file_path, content_hash, output_metadata)`; the newest wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCacheRow {
    pub file_path: String,
    pub content_hash: String,
    /// Discriminates output variants of the same input (e.g. a flattened
    /// kind/prog_lang/language/format tuple).
    pub output_metadata: String,
    pub correlation_id: Option<String>,
    /// Serialized artifact bytes plus any driver-defined metadata.
    pub result: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Whether an `IssueRow` records an error or a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Error,
    Warning,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::Error => "error",
            IssueKind::Warning => "warning",
        }
    }
}

/// A row in the issue log (`cache.db`'s `processing_issues` table), so a
/// cache hit can still surface the errors/warnings of the run that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRow {
    pub file_path: String,
    pub content_hash: String,
    pub output_metadata: String,
    pub kind: IssueKind,
    /// JSON-encoded categorized issue (see `jobforge_protocol::error`).
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// A row in the lightweight queue cache (`jobs.db`'s `results_cache`
/// table) — "has this output file already been produced with this hash?"
/// with no artifact blob attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueCacheRow {
    pub output_file: String,
    pub content_hash: String,
    pub result_metadata: serde_json::Value,
    pub last_accessed: DateTime<Utc>,
    pub access_count: i64,
}
