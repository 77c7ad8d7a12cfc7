//! Funnel worker binary
//!
//! Runs the scheduler and queue consumers in one process, and exposes the
//! operator controls (pause, resume, cancel, retry, export) as subcommands.

use anyhow::Context;
use clap::{Parser, Subcommand};
use funnel::broker::MemoryBroker;
use funnel::bulk::BulkOrchestrator;
use funnel::channel::{ChannelProvider, ConfiguredChannelProvider};
use funnel::clock::{Clock, SystemClock};
use funnel::config::{ConfigLoader, FunnelConfig, LoggingConfig};
use funnel::db::DatabaseConnection;
use funnel::interpreter::Interpreter;
use funnel::reconciler::{Callback, Reconciler};
use funnel::scheduler::Scheduler;
use funnel::worker::{NotePoster, Worker};
use funnel::{ExecutionControl, ShutdownCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "funnel-worker")]
#[command(about = "Funnel - campaign workflow engine", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "FUNNEL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and workers until interrupted (default)
    Run {
        /// Read newline-delimited JSON channel callbacks from stdin
        #[arg(long)]
        callbacks_stdin: bool,
    },

    /// Pause a bulk send at its next batch boundary
    Pause {
        /// Execution ID
        id: String,
    },

    /// Resume a paused bulk send
    Resume {
        /// Execution ID
        id: String,
    },

    /// Cancel an execution
    Cancel {
        /// Execution ID
        id: String,
    },

    /// Queue a failed execution again
    Retry {
        /// Execution ID
        id: String,
    },

    /// Print counters and failure reasons of an execution as JSON
    ExportFailures {
        /// Execution ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load(cli.config.as_deref()).await?;
    init_tracing(&config.logging);

    let db = DatabaseConnection::with_max_connections(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;
    db.run_migrations().await.context("Failed to run migrations")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let control = ExecutionControl::new(db.pool().clone(), clock.clone());

    match cli.command.unwrap_or(Commands::Run { callbacks_stdin: false }) {
        Commands::Run { callbacks_stdin } => run(config, db, clock, callbacks_stdin).await?,
        Commands::Pause { id } => {
            let status = control.pause(&id).await?;
            println!("{} {}", id, status);
        }
        Commands::Resume { id } => {
            let status = control.resume(&id).await?;
            println!("{} {}", id, status);
        }
        Commands::Cancel { id } => {
            let status = control.cancel(&id).await?;
            println!("{} {}", id, status);
        }
        Commands::Retry { id } => {
            let queued = control.retry(&id).await?;
            println!("{} queued {} recipient(s)", id, queued);
        }
        Commands::ExportFailures { id } => {
            let report = control.export_failures(&id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// RUST_LOG wins over the configured level
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

async fn run(
    config: FunnelConfig,
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    callbacks_stdin: bool,
) -> anyhow::Result<()> {
    let shutdown = ShutdownCoordinator::new();
    let _signal_handler = shutdown.install_signal_handlers();

    let pool = db.pool().clone();
    let broker = Arc::new(MemoryBroker::new());
    let provider = ConfiguredChannelProvider::from_config(&config.tenants)?;
    tracing::info!(tenants = ?provider.tenant_ids().collect::<Vec<_>>(), "Channel bindings ready");
    let provider: Arc<dyn ChannelProvider> = Arc::new(provider);

    let interpreter = Arc::new(Interpreter::new(
        pool.clone(),
        provider.clone(),
        clock.clone(),
        config.interpreter.clone(),
        config.worker.id.clone(),
    ));
    let orchestrator = Arc::new(BulkOrchestrator::new(
        pool.clone(),
        broker.clone(),
        provider.clone(),
        interpreter.clone(),
        config.bulk.clone(),
        config.worker.id.clone(),
    ));
    let notes = Arc::new(NotePoster::new(pool.clone(), provider));

    let worker = Worker::new(broker.clone(), interpreter, orchestrator, notes, config.worker.prefetch);
    let scheduler = Scheduler::new(pool.clone(), broker.clone(), clock.clone(), config.scheduler.clone());

    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));

    if callbacks_stdin {
        let reconciler = Reconciler::new(pool, broker.clone(), clock, config.reconciler.clone());
        tokio::spawn(relay_callbacks(reconciler, shutdown.clone()));
    }

    tracing::info!(worker_id = %config.worker.id, version = funnel::VERSION, "Funnel worker running");
    shutdown.wait_for_shutdown().await;

    scheduler_task.await.context("Scheduler task panicked")?;
    worker_task.await.context("Worker task panicked")?;
    broker.close();
    db.close().await;

    tracing::info!("Funnel worker stopped");
    Ok(())
}

/// Apply callbacks read from stdin, one JSON object per line
async fn relay_callbacks(reconciler: Reconciler, shutdown: ShutdownCoordinator) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("Callback input closed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read callback input");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Callback>(&line) {
            Ok(callback) => {
                if let Err(e) = reconciler.handle(&callback).await {
                    tracing::error!(error = %e, "Callback failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Malformed callback skipped"),
        }
    }
}
