//! Job Forge worker entry point.
//!
//! Usage:
//!     jobforge-worker --worker-type notebook --db-path ./jobs.db --workspace-path .
//!
//! Reads its identity and storage location from flags or the environment
//! (spec §6), registers with the store, and runs the claim loop. Domain
//! execution is out of scope here: this binary wires `UnimplementedHandler`
//! so it can be exercised end-to-end; embedders link `jobforge_worker` as a
//! library and supply a real `JobHandler` instead of running this binary.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobforge_store::pool::DbConfig;
use jobforge_store::JobsDb;
use jobforge_worker::{UnimplementedHandler, WorkerRuntime, WorkerRuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "jobforge-worker", about = "Job Forge worker process")]
struct Args {
    /// Job type this worker claims (notebook, plantuml, drawio).
    #[arg(long, env = "WORKER_TYPE")]
    worker_type: String,

    /// Stable executor identity; auto-generated if not provided. The
    /// `direct-`/`docker-` prefix convention tells the store which
    /// execution mode registered this row.
    #[arg(long, env = "EXECUTOR_ID")]
    executor_id: Option<String>,

    /// Path to the jobs database.
    #[arg(long, env = "DB_PATH", default_value = "jobs.db")]
    db_path: PathBuf,

    /// Workspace root this worker reads input artifacts relative to.
    #[arg(long, env = "WORKSPACE_PATH", default_value = ".")]
    workspace_path: PathBuf,

    /// Worker id for log correlation only (the store assigns the real
    /// numeric id on registration).
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobforge_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let executor_id = args.executor_id.unwrap_or_else(|| {
        format!(
            "direct-{}-{}",
            args.worker_type,
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        )
    });

    tracing::info!(worker_type = %args.worker_type, executor_id = %executor_id, db_path = %args.db_path.display(), workspace_path = %args.workspace_path.display(), "starting Job Forge worker");

    let jobs_db = Arc::new(JobsDb::open(&DbConfig::file(&args.db_path)).await?);

    let config = WorkerRuntimeConfig::new(args.worker_type, executor_id);
    let runtime = WorkerRuntime::new(jobs_db, Arc::new(UnimplementedHandler), config);

    let shutdown = CancellationToken::new();
    let shutdown_on_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_on_signal.cancel();
    });

    runtime.run(shutdown).await?;

    Ok(())
}
