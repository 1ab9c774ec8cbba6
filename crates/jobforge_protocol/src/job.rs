//! The `Job` record and its closed set of job types and statuses.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric primary key of a `jobs` row. Assigned on submit.
pub type JobId = i64;

/// The closed enumeration of job types the core substrate knows how to
/// route. Domain semantics (what a notebook render actually does) are
/// opaque to this crate; only the type tag travels with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Notebook,
    PlantUml,
    DrawIo,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Notebook => "notebook",
            JobType::PlantUml => "plantuml",
            JobType::DrawIo => "drawio",
        }
    }

    /// Every known job type, for callers that need to iterate the closed
    /// enumeration (e.g. the pool manager starting one fleet per type).
    pub const fn all() -> [JobType; 3] {
        [JobType::Notebook, JobType::PlantUml, JobType::DrawIo]
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a known job type.
#[derive(Debug, thiserror::Error)]
#[error("unknown job type: {0}")]
pub struct UnknownJobType(pub String);

impl FromStr for JobType {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notebook" => Ok(JobType::Notebook),
            "plantuml" => Ok(JobType::PlantUml),
            "drawio" => Ok(JobType::DrawIo),
            other => Err(UnknownJobType(other.to_string())),
        }
    }
}

/// Job lifecycle status. `started_at` is set iff status is one of
/// `Processing`, `Completed`, `Failed`; `completed_at` iff `Completed` or
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownJobType(other.to_string())),
        }
    }
}

/// A unit of work in the queue. See spec §3 for field-level invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub input_file: String,
    pub output_file: String,
    pub content_hash: String,
    /// Opaque, job-type-specific parameters. The core never interprets
    /// these keys beyond passing them through to the worker.
    pub payload: Value,
    pub priority: i64,
    pub attempts: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_worker_id: Option<i64>,
    pub error: Option<String>,
    pub correlation_id: Option<String>,
}

impl Job {
    pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

    /// Whether this job has exhausted its retry budget and should never be
    /// returned by `ClaimNext` again.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
