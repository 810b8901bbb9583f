//! # Scanflow Worker
//!
//! Executor process for content scans. Each worker polls the direct queue
//! (orchestrators) and the `content_scan` queue (batch workers) out of a
//! shared Postgres database; any number of workers may run side by side.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use scanflow_core::{
    MIGRATOR,
    content_scan::{
        self, HttpScanningService, PostgresScanRecordStore, ScanRecordStore, ScanningService,
    },
    durable::{PostgresStore, WorkflowRegistry, WorkflowRuntime},
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigLoader, DatabaseConfig, WorkerConfig};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "scanflow-worker")]
#[command(about = "Runs content-scan orchestrators and batch workers")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Emit JSON logs (overrides `log.json`)
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply migrations and serve the workflow queues until interrupted
    Run,
    /// Apply database migrations and exit
    Migrate,
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.config.clone() {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = cli.env_file.clone() {
        loader = loader.with_env_file(path);
    }
    let config = loader.load().context("failed to load configuration")?;

    init_tracing(cli.log_json || config.log.json);
    match &config.metadata.config_path {
        Some(path) => info!(path = %path.display(), "configuration file loaded"),
        None => warn!("no scanflow.toml detected; using environment variables only"),
    }
    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }

    match cli.command {
        Command::CheckConfig => {
            info!(
                executor_id = %config.runtime.executor_id,
                scanner = %config.scanner.url,
                queue = %config.content_scan.queue.name,
                worker_concurrency = config.content_scan.queue.worker_concurrency,
                concurrency = ?config.content_scan.queue.concurrency,
                batch_recv_timeout_secs = config.content_scan.batch_recv_timeout_secs,
                post_all_transmitted_timeout_secs =
                    config.content_scan.post_all_transmitted_timeout_secs,
                "configuration is valid"
            );
            Ok(())
        }
        Command::Migrate => {
            let pool = connect(&config.database).await?;
            migrate(&pool).await?;
            pool.close().await;
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,scanflow_core=info,sqlx=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect(database: &DatabaseConfig) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(database.max_connections)
        .min_connections(database.min_connections)
        .acquire_timeout(database.acquire_timeout())
        .test_before_acquire(true)
        .connect(&database.url)
        .await
        .context("failed to connect to PostgreSQL")
}

async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("database migration failed")?;
    info!("database migrations applied");
    Ok(())
}

async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let pool = connect(&config.database).await?;
    migrate(&pool).await?;

    let store = Arc::new(
        PostgresStore::new(pool.clone(), config.runtime.recv_poll_interval())
            .await
            .context("workflow store health check failed")?,
    );
    let records: Arc<dyn ScanRecordStore> = Arc::new(PostgresScanRecordStore::new(pool.clone()));
    let scanner: Arc<dyn ScanningService> = Arc::new(
        HttpScanningService::new(config.scanner.url.clone(), config.scanner.timeout())
            .context("failed to build scanning service client")?,
    );

    let mut registry = WorkflowRegistry::new();
    content_scan::register_content_scan_workflows(
        &mut registry,
        records,
        scanner,
        config.content_scan.clone(),
    );

    let runtime = WorkflowRuntime::new(config.runtime.clone(), store, registry)
        .with_queue(config.content_scan.queue.clone());
    runtime
        .start()
        .await
        .context("failed to start workflow runtime")?;
    info!(
        executor_id = %config.runtime.executor_id,
        queue = %config.content_scan.queue.name,
        worker_concurrency = config.content_scan.queue.worker_concurrency,
        "worker started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    runtime
        .shutdown()
        .await
        .context("workflow runtime did not shut down cleanly")?;
    pool.close().await;
    info!("worker stopped");
    Ok(())
}
