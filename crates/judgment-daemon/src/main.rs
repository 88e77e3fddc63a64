//! judgmentd - Anchor and ledger engine daemon binary.
//!
//! Loads configuration, opens the shared database connection, assembles the
//! service, and runs the proof-upgrade worker until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rusqlite::Connection;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use judgment_core::config::EngineConfig;
use judgment_daemon::anchor::{AnchorService, OtsCliTransport};
use judgment_daemon::ledger::BillingLedger;
use judgment_daemon::store::RecordStore;
use judgment_daemon::worker::ProofUpgradeWorker;

#[derive(Parser, Debug)]
#[command(name = "judgmentd", about = "Anchor and ledger engine daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the database path from the configuration file.
    #[arg(long)]
    database: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(database) = args.database {
        config.database.path = database;
    }

    config.validate().context("validating configuration")?;

    let conn = Connection::open(&config.database.path)
        .with_context(|| format!("opening database {}", config.database.path.display()))?;
    let conn = Arc::new(Mutex::new(conn));

    let store = RecordStore::new(Arc::clone(&conn)).context("initializing record store")?;
    // Initializes the billing schema even though the binary itself only runs
    // the worker; the service API shares this database.
    let _ledger = BillingLedger::new(
        Arc::clone(&conn),
        config.billing.min_deposit,
        config.billing.max_deposit,
    )
    .context("initializing billing ledger")?;

    let anchors = AnchorService::new().with_transport(Arc::new(OtsCliTransport::new(
        config.transport.ots_binary.clone(),
        Duration::from_secs(config.transport.timeout_secs),
    )));

    let worker = ProofUpgradeWorker::new(
        store,
        anchors,
        Duration::from_secs(config.worker.poll_interval_secs),
        Duration::from_secs(config.worker.item_timeout_secs),
        config.worker.batch_size,
    );
    let shutdown = worker.shutdown_handle();
    let worker_task = tokio::spawn(worker.run());

    info!(
        database = %config.database.path.display(),
        "judgmentd started"
    );

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    worker_task.abort();
    let _ = worker_task.await;

    info!("judgmentd stopped");
    Ok(())
}
