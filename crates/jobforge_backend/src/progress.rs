//! Progress tracking and error reporting hooks (spec §4.H step 5).
//!
//! Ported from `original_source`'s `ProgressTracker`/`JobInfo`: the core
//! only needs `job_submitted`/`job_completed`/`job_failed` notifications
//! plus an end-of-run summary; how those are rendered (log lines, a TUI
//! progress bar, a build reporter) is the driver's concern, so both are
//! injected as trait objects with a `tracing`-based default.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use jobforge_protocol::error::CategorizedError;
use jobforge_protocol::job::JobId;

/// Notified as jobs move through submission, completion, and failure.
/// Implementations must be safe to call from the polling loop without
/// blocking it for long.
pub trait ProgressTracker: Send + Sync {
    fn job_submitted(&self, job_id: JobId, job_type: &str, input_file: &str);
    fn job_completed(&self, job_id: JobId);
    fn job_failed(&self, job_id: JobId, error: &str);
    /// Emit a final summary (counts, longest-running jobs) at the end of
    /// a `WaitForCompletion` call.
    fn log_summary(&self);
}

#[derive(Debug, Clone)]
struct JobInfo {
    job_type: String,
    input_file: String,
    submitted_at: DateTime<Utc>,
}

/// Default tracker: logs transitions via `tracing` and keeps enough state
/// in memory to print a summary, mirroring `original_source`'s
/// `ProgressTracker` without its periodic-interval background logging
/// thread (the polling loop here already yields often enough that a
/// separate ticker would be redundant).
#[derive(Default)]
pub struct LoggingProgressTracker {
    jobs: Mutex<HashMap<JobId, JobInfo>>,
    completed: Mutex<u64>,
    failed: Mutex<u64>,
}

impl LoggingProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressTracker for LoggingProgressTracker {
    fn job_submitted(&self, job_id: JobId, job_type: &str, input_file: &str) {
        self.jobs.lock().unwrap().insert(
            job_id,
            JobInfo {
                job_type: job_type.to_string(),
                input_file: input_file.to_string(),
                submitted_at: Utc::now(),
            },
        );
        info!(job_id, job_type, input_file, "job submitted");
    }

    fn job_completed(&self, job_id: JobId) {
        *self.completed.lock().unwrap() += 1;
        if let Some(job) = self.jobs.lock().unwrap().get(&job_id) {
            info!(job_id, input_file = %job.input_file, "job completed");
        }
    }

    fn job_failed(&self, job_id: JobId, error: &str) {
        *self.failed.lock().unwrap() += 1;
        if let Some(job) = self.jobs.lock().unwrap().get(&job_id) {
            error!(job_id, input_file = %job.input_file, error, "job failed");
        }
    }

    fn log_summary(&self) {
        let completed = *self.completed.lock().unwrap();
        let failed = *self.failed.lock().unwrap();
        info!(completed, failed, "job forge run summary");
    }
}

/// Receives a fully-categorized failure for driver-level rendering
/// (spec §7's propagation policy: per-job errors are surfaced, not just
/// logged and discarded).
pub trait BuildReporter: Send + Sync {
    fn report_error(&self, error: &CategorizedError);
}

/// Default reporter: logs the categorized error at `error` level.
#[derive(Default)]
pub struct LoggingBuildReporter;

impl BuildReporter for LoggingBuildReporter {
    fn report_error(&self, error: &CategorizedError) {
        error!(
            category = %error.category,
            file = %error.file_path,
            message = %error.message,
            "{}",
            error.actionable_guidance
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_completions_and_failures() {
        let tracker = LoggingProgressTracker::new();
        tracker.job_submitted(1, "notebook", "a.ipynb");
        tracker.job_submitted(2, "notebook", "b.ipynb");
        tracker.job_completed(1);
        tracker.job_failed(2, "boom");

        assert_eq!(*tracker.completed.lock().unwrap(), 1);
        assert_eq!(*tracker.failed.lock().unwrap(), 1);
    }
}
