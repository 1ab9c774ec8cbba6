//! Worker-management configuration (spec §6) and the CLI-overlay merge.
//!
//! `WorkersManagementConfig` is the config-file shape; `CliOverlay`
//! carries the flags a driver's CLI parser produces. Config loading
//! itself (file format, discovery) is the driver's concern — this crate
//! only defines the struct and the merge rule: CLI-shaped keys always
//! win over config-shaped keys.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use jobforge_protocol::worker::ExecutionMode;

/// Per-worker-type overrides layered on top of the `default_*` fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerTypeOverride {
    pub count: Option<u32>,
    pub execution_mode: Option<ExecutionMode>,
    pub image: Option<String>,
    pub memory_limit: Option<String>,
    pub max_job_time: Option<u64>,
}

/// The worker-management configuration recognized by the pool manager
/// and lifecycle manager (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersManagementConfig {
    pub default_execution_mode: ExecutionMode,
    pub default_worker_count: u32,
    pub auto_start: bool,
    pub auto_stop: bool,
    pub reuse_workers: bool,
    #[serde(default)]
    pub per_type: HashMap<String, WorkerTypeOverride>,
}

impl Default for WorkersManagementConfig {
    fn default() -> Self {
        Self {
            default_execution_mode: ExecutionMode::Direct,
            default_worker_count: 1,
            auto_start: true,
            auto_stop: true,
            reuse_workers: false,
            per_type: HashMap::new(),
        }
    }
}

/// The fully-resolved configuration for launching one worker type's
/// fleet, after merging defaults with per-type overrides.
#[derive(Debug, Clone)]
pub struct ResolvedWorkerConfig {
    pub worker_type: String,
    pub count: u32,
    pub execution_mode: ExecutionMode,
    pub image: Option<String>,
    pub memory_limit: Option<String>,
    pub max_job_time_secs: Option<u64>,
}

impl WorkersManagementConfig {
    /// Resolve the effective launch configuration for `worker_type`,
    /// applying any per-type override on top of the defaults.
    pub fn resolve(&self, worker_type: &str) -> ResolvedWorkerConfig {
        let default_override = WorkerTypeOverride::default();
        let over = self.per_type.get(worker_type).unwrap_or(&default_override);

        ResolvedWorkerConfig {
            worker_type: worker_type.to_string(),
            count: over.count.unwrap_or(self.default_worker_count),
            execution_mode: over.execution_mode.unwrap_or(self.default_execution_mode),
            image: over.image.clone(),
            memory_limit: over.memory_limit.clone(),
            max_job_time_secs: over.max_job_time,
        }
    }
}

/// CLI-shaped flags that override the config-file shape (spec §6). Every
/// field here, if set, takes precedence over the corresponding
/// `WorkersManagementConfig` field.
#[derive(Debug, Clone, Default)]
pub struct CliOverlay {
    /// Overrides `default_execution_mode`.
    pub workers: Option<ExecutionMode>,
    /// Overrides `default_worker_count`.
    pub worker_count: Option<u32>,
    /// Disables `auto_start`.
    pub no_auto_start: bool,
    /// Disables `auto_stop`.
    pub no_auto_stop: bool,
    /// Disables `reuse_workers` (forces a clean fleet).
    pub fresh_workers: bool,
    /// `<type>_workers` overrides, keyed by worker type.
    pub per_type_worker_count: HashMap<String, u32>,
}

impl CliOverlay {
    /// Apply this overlay on top of `config`, returning the merged
    /// configuration. CLI-shaped keys always win.
    pub fn apply(&self, config: &WorkersManagementConfig) -> WorkersManagementConfig {
        let mut merged = config.clone();

        if let Some(mode) = self.workers {
            merged.default_execution_mode = mode;
        }
        if let Some(count) = self.worker_count {
            merged.default_worker_count = count;
        }
        if self.no_auto_start {
            merged.auto_start = false;
        }
        if self.no_auto_stop {
            merged.auto_stop = false;
        }
        if self.fresh_workers {
            merged.reuse_workers = false;
        }
        for (worker_type, count) in &self.per_type_worker_count {
            merged
                .per_type
                .entry(worker_type.clone())
                .or_default()
                .count = Some(*count);
        }

        merged
    }
}
