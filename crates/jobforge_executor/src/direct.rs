//! Subprocess-mode worker executor (spec §4.D "Subprocess variant").
//!
//! Launches the worker entry-point binary as a child process, placing it
//! in its own process group on Unix so `stop_worker` can signal the
//! whole group rather than just the direct child. Resource stats are
//! liveness-only: without a system-stats library, CPU/memory accounting
//! isn't available, so `get_worker_stats` reports only whether the
//! process is still alive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::contract::{WorkerExecutor, WorkerLaunchConfig};
use crate::error::Result;
use crate::stats::WorkerStats;

/// Grace period between SIGTERM and SIGKILL (Unix) / before giving up
/// waiting for the child to exit (Windows), per spec §5.
const STOP_GRACE: Duration = Duration::from_secs(10);

struct RunningChild {
    child: Child,
    pid: u32,
}

/// Launches workers as plain subprocesses of the orchestrator.
pub struct DirectExecutor {
    /// Path to the worker entry-point binary (`jobforge_worker` by
    /// default; overridable so tests can point at a stub).
    worker_binary: PathBuf,
    children: Mutex<HashMap<String, RunningChild>>,
}

impl DirectExecutor {
    pub fn new(worker_binary: impl Into<PathBuf>) -> Self {
        Self {
            worker_binary: worker_binary.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Default executor pointing at the `jobforge-worker` binary,
    /// resolved from `PATH` the way a sibling binary installed alongside
    /// the driver would be.
    pub fn default_binary() -> Self {
        Self::new("jobforge-worker")
    }

    fn new_executor_id(worker_type: &str, index: usize) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("direct-{worker_type}-{index}-{}", &suffix[..8])
    }
}

#[cfg(unix)]
fn set_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid/setpgid-equivalent process_group(0) is applied
    // post-fork, pre-exec, by the tokio/std process machinery; no
    // resources are shared with the parent across the fork boundary
    // here beyond what CommandExt already guarantees is safe.
    unsafe {
        command.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[async_trait]
impl WorkerExecutor for DirectExecutor {
    async fn start_worker(
        &self,
        index: usize,
        config: &WorkerLaunchConfig,
    ) -> Result<Option<String>> {
        let executor_id = Self::new_executor_id(&config.worker_type, index);
        let worker_id = Uuid::new_v4().to_string();

        let mut command = Command::new(&self.worker_binary);
        command
            .env("WORKER_TYPE", &config.worker_type)
            .env("WORKER_ID", &worker_id)
            .env("DB_PATH", &config.db_path)
            .env("WORKSPACE_PATH", &config.workspace_path)
            .env("LOG_LEVEL", &config.log_level)
            .env("EXECUTOR_ID", &executor_id)
            .env("JOBFORGE_QUEUE_PROTOCOL", "sqlite")
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        if let Some(max_job_time) = config.max_job_time_secs {
            command.env("MAX_JOB_TIME_SECS", max_job_time.to_string());
        }

        #[cfg(unix)]
        set_process_group(&mut command);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(worker_type = %config.worker_type, index, error = %err, "failed to spawn direct worker");
                return Ok(None);
            }
        };

        let Some(pid) = child.id() else {
            error!(worker_type = %config.worker_type, index, "spawned child has no pid");
            return Ok(None);
        };

        self.children
            .lock()
            .await
            .insert(executor_id.clone(), RunningChild { child, pid });

        info!(executor_id = %executor_id, pid, "started direct worker");
        Ok(Some(executor_id))
    }

    async fn stop_worker(&self, executor_id: &str) -> Result<bool> {
        let mut children = self.children.lock().await;
        let Some(mut running) = children.remove(executor_id) else {
            return Ok(false);
        };
        drop(children);

        #[cfg(unix)]
        {
            signal_group(running.pid, libc::SIGTERM);
            let waited = tokio::time::timeout(STOP_GRACE, running.child.wait()).await;
            if waited.is_err() {
                warn!(executor_id, "worker did not exit after SIGTERM, sending SIGKILL");
                signal_group(running.pid, libc::SIGKILL);
                if tokio::time::timeout(STOP_GRACE, running.child.wait()).await.is_err() {
                    error!(executor_id, "worker did not exit after SIGKILL within the grace period");
                    return Err(crate::error::ExecutorError::StopTimedOut(executor_id.to_string()));
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = running.child.kill().await;
            if tokio::time::timeout(STOP_GRACE, running.child.wait()).await.is_err() {
                error!(executor_id, "worker did not exit after kill within the grace period");
                return Err(crate::error::ExecutorError::StopTimedOut(executor_id.to_string()));
            }
        }

        Ok(true)
    }

    async fn is_worker_running(&self, executor_id: &str) -> Result<bool> {
        let mut children = self.children.lock().await;
        let Some(running) = children.get_mut(executor_id) else {
            return Ok(false);
        };

        match running.child.try_wait() {
            Ok(Some(_status)) => {
                children.remove(executor_id);
                Ok(false)
            }
            Ok(None) => Ok(true),
            Err(_) => {
                #[cfg(unix)]
                {
                    Ok(process_is_alive(running.pid))
                }
                #[cfg(not(unix))]
                {
                    Ok(false)
                }
            }
        }
    }

    async fn get_worker_stats(&self, executor_id: &str) -> Result<Option<WorkerStats>> {
        let running = self.is_worker_running(executor_id).await?;
        if running {
            Ok(Some(WorkerStats::alive_unknown_usage()))
        } else {
            Ok(Some(WorkerStats::dead()))
        }
    }

    async fn cleanup(&self) -> Result<()> {
        let executor_ids: Vec<String> = self.children.lock().await.keys().cloned().collect();
        for executor_id in executor_ids {
            let _ = self.stop_worker(&executor_id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerLaunchConfig {
        WorkerLaunchConfig {
            worker_type: "notebook".to_string(),
            db_path: "/tmp/jobs.db".to_string(),
            workspace_path: "/tmp/workspace".to_string(),
            log_level: "info".to_string(),
            image: None,
            memory_limit: None,
            network: None,
            max_job_time_secs: None,
        }
    }

    #[test]
    fn executor_id_matches_direct_prefix_shape() {
        let id = DirectExecutor::new_executor_id("notebook", 2);
        assert!(id.starts_with("direct-notebook-2-"));
        assert_eq!(id.split('-').last().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn start_worker_returns_none_when_binary_missing() {
        let executor = DirectExecutor::new("/nonexistent/jobforge-worker-binary");
        let result = executor.start_worker(0, &config()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn stop_worker_returns_false_for_unknown_executor_id() {
        let executor = DirectExecutor::default_binary();
        assert!(!executor.stop_worker("direct-notebook-0-deadbeef").await.unwrap());
    }

    #[tokio::test]
    async fn is_worker_running_false_for_unknown_executor_id() {
        let executor = DirectExecutor::default_binary();
        assert!(!executor.is_worker_running("direct-notebook-0-deadbeef").await.unwrap());
    }
}
