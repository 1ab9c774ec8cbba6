//! The `Worker` record, execution modes, and the worker health state
//! machine (spec §4.E: idle -> busy -> hung -> dead -> deleted).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::UnknownJobType;

/// Numeric primary key of a `workers` row.
pub type WorkerId = i64;

/// How a worker process was launched. `Direct` workers have an
/// `executor_id` prefixed `direct-`; `Docker` workers have a container id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Direct,
    Docker,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Direct => "direct",
            ExecutionMode::Docker => "docker",
        }
    }

    /// Infer the mode from an executor id's `direct-` prefix convention.
    pub fn from_executor_id(executor_id: &str) -> Self {
        if executor_id.starts_with("direct-") {
            ExecutionMode::Direct
        } else {
            ExecutionMode::Docker
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ExecutionMode::Direct),
            "docker" => Ok(ExecutionMode::Docker),
            other => Err(UnknownJobType(other.to_string())),
        }
    }
}

/// Worker health/lifecycle status, persisted as the `workers.status`
/// column. Transitions `busy -> hung -> dead` are driven by health rules
/// (see `jobforge_pool::health`), not written directly by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Hung,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Hung => "hung",
            WorkerStatus::Dead => "dead",
        }
    }

    /// Rule 1 of `CheckWorkerHealth`: only idle/busy workers can be
    /// healthy at all, regardless of heartbeat age.
    pub fn is_candidate_for_health(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "hung" => Ok(WorkerStatus::Hung),
            "dead" => Ok(WorkerStatus::Dead),
            other => Err(UnknownJobType(other.to_string())),
        }
    }
}

/// A registered worker process. Inserted by the worker itself on first
/// heartbeat, updated by subsequent heartbeats, deleted on graceful
/// shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub worker_type: String,
    pub execution_mode: ExecutionMode,
    /// Stable handle chosen by the executor (container id, `direct-...`
    /// string). Never parsed for meaning beyond the `direct-` prefix.
    pub executor_id: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub jobs_processed: i64,
    pub jobs_failed: i64,
    pub started_at: DateTime<Utc>,
}
