//! Container-mode worker executor (spec §4.D "Container variant").
//!
//! Creates and starts a container from a configured image, mounting the
//! workspace directory and the database directory and wiring a
//! pre-existing network so the worker can reach the same SQLite files
//! and (via the RPC bridge) the orchestrator. CPU/memory stats are read
//! from the container's own stats stream, not the host's.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{error, info, warn};

use crate::contract::{WorkerExecutor, WorkerLaunchConfig};
use crate::error::Result;
use crate::stats::WorkerStats;

const STOP_GRACE_SECS: i64 = 10;

/// Launches workers as containers on a configured Docker daemon.
pub struct DockerExecutor {
    docker: Docker,
    /// Host directory bind-mounted as the database directory inside the
    /// container, alongside each job's `workspace_path`.
    db_dir: String,
}

impl DockerExecutor {
    pub fn new(docker: Docker, db_dir: impl Into<String>) -> Self {
        Self {
            docker,
            db_dir: db_dir.into(),
        }
    }

    /// Connect using the platform-default Docker socket, the way a
    /// locally-run pool manager would.
    pub fn connect_default(db_dir: impl Into<String>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker, db_dir))
    }

    fn container_name(worker_type: &str, index: usize) -> String {
        format!("jobforge-worker-{worker_type}-{index}")
    }

    /// Remove a container with this name if one already exists, per
    /// spec §4.D: "if a container with the intended name already exists
    /// it is forcibly removed before starting a fresh one."
    async fn remove_if_exists(&self, name: &str) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let existing = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        for container in existing {
            if let Some(id) = container.id {
                warn!(name, id, "removing stale container with same name");
                let _ = self
                    .docker
                    .remove_container(
                        &id,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerExecutor for DockerExecutor {
    async fn start_worker(
        &self,
        index: usize,
        config: &WorkerLaunchConfig,
    ) -> Result<Option<String>> {
        let Some(image) = config.image.as_deref() else {
            error!(worker_type = %config.worker_type, "docker executor requires a configured image");
            return Ok(None);
        };

        let name = Self::container_name(&config.worker_type, index);
        if let Err(err) = self.remove_if_exists(&name).await {
            error!(name, error = %err, "failed to clear stale container");
            return Ok(None);
        }

        let worker_id = uuid::Uuid::new_v4().to_string();
        // The container name, not the daemon-assigned id, travels as
        // `EXECUTOR_ID` and is what `start_worker` returns: it is known
        // before `create_container` replies, and bollard accepts a name
        // anywhere it accepts an id for subsequent operations.
        let env = vec![
            format!("WORKER_TYPE={}", config.worker_type),
            format!("WORKER_ID={worker_id}"),
            format!("DB_PATH={}", config.db_path),
            format!("WORKSPACE_PATH={}", config.workspace_path),
            format!("LOG_LEVEL={}", config.log_level),
            format!("EXECUTOR_ID={name}"),
            "JOBFORGE_QUEUE_PROTOCOL=sqlite".to_string(),
        ];

        let mounts = vec![
            Mount {
                target: Some(config.workspace_path.clone()),
                source: Some(config.workspace_path.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            },
            Mount {
                target: Some(self.db_dir.clone()),
                source: Some(self.db_dir.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            },
        ];

        let host_config = HostConfig {
            mounts: Some(mounts),
            network_mode: config.network.clone(),
            memory: config.memory_limit.as_deref().and_then(parse_memory_limit),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(image.to_string()),
            env: Some(env),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = match self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
        {
            Ok(created) => created,
            Err(err) => {
                error!(name, error = %err, "failed to create container");
                return Ok(None);
            }
        };

        if let Err(err) = self.docker.start_container::<String>(&created.id, None).await {
            error!(name, error = %err, "failed to start container");
            return Ok(None);
        }

        info!(executor_id = %name, container_id = %created.id, "started docker worker");
        Ok(Some(name))
    }

    async fn stop_worker(&self, executor_id: &str) -> Result<bool> {
        match self
            .docker
            .stop_container(
                executor_id,
                Some(StopContainerOptions {
                    t: STOP_GRACE_SECS,
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        self.docker
            .remove_container(
                executor_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;

        Ok(true)
    }

    async fn is_worker_running(&self, executor_id: &str) -> Result<bool> {
        let inspect = self.docker.inspect_container(executor_id, None).await;
        match inspect {
            Ok(details) => Ok(details
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_worker_stats(&self, executor_id: &str) -> Result<Option<WorkerStats>> {
        let mut stream = self.docker.stats(
            executor_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );

        let Some(sample) = stream.next().await else {
            return Ok(None);
        };
        let sample = match sample {
            Ok(sample) => sample,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let cpu_delta = sample.cpu_stats.cpu_usage.total_usage as f64
            - sample.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = sample.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - sample.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = sample.cpu_stats.online_cpus.unwrap_or(1) as f64;

        let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
            Some((cpu_delta / system_delta) * online_cpus * 100.0)
        } else {
            Some(0.0)
        };

        let memory_bytes = sample.memory_stats.usage;

        Ok(Some(WorkerStats {
            alive: true,
            cpu_percent,
            memory_bytes,
        }))
    }

    async fn cleanup(&self) -> Result<()> {
        // The bollard client has no open resources beyond its HTTP(S)
        // connection, which is dropped with `self`.
        Ok(())
    }
}

/// Parse a memory limit string like `"512m"` or `"2g"` into bytes.
fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    let (number, multiplier) = if let Some(n) = limit.strip_suffix('g') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = limit.strip_suffix('m') {
        (n, 1024 * 1024)
    } else if let Some(n) = limit.strip_suffix('k') {
        (n, 1024)
    } else {
        (limit.as_str(), 1)
    };
    number.trim().parse::<i64>().ok().map(|v| v * multiplier)
}

/// Convenience for tests/callers that only have a host directory path.
pub fn db_dir_from_path(db_path: &str) -> String {
    Path::new(db_path)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| db_path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_limit_suffixes() {
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("100k"), Some(100 * 1024));
        assert_eq!(parse_memory_limit("bogus"), None);
    }

    #[test]
    fn container_name_is_stable_per_type_and_index() {
        assert_eq!(
            DockerExecutor::container_name("notebook", 3),
            "jobforge-worker-notebook-3"
        );
    }

    #[test]
    fn db_dir_from_path_takes_parent() {
        assert_eq!(db_dir_from_path("/data/jobs.db"), "/data");
    }
}
