//! Lightweight liveness/resource reporting for a running worker.
//!
//! Intentionally shallow: CPU/memory accounting mirrors only what each
//! executor backend can read cheaply (container stats for Docker, liveness
//! alone for direct subprocesses — matching the resource-stats ceiling the
//! original implementation accepted without a psutil-equivalent
//! dependency).

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorkerStats {
    pub alive: bool,
    pub cpu_percent: Option<f64>,
    pub memory_bytes: Option<u64>,
}

impl WorkerStats {
    pub fn alive_unknown_usage() -> Self {
        Self {
            alive: true,
            cpu_percent: None,
            memory_bytes: None,
        }
    }

    pub fn dead() -> Self {
        Self {
            alive: false,
            cpu_percent: None,
            memory_bytes: None,
        }
    }
}
