use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pland::config::DaemonConfig;
use pland::dispatch::Dispatcher;
use pland::events::ResultBroker;
use pland::handlers;
use pland::inference::HttpInferenceClient;
use pland::rest;
use pland::tasks::{reaper, TaskStorage};
use pland::AppContext;

#[derive(Parser)]
#[command(
    name = "pland",
    about = "Planner Host — background task dispatch and streaming daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST API port
    #[arg(long, env = "PLAND_PORT")]
    port: Option<u16>,

    /// Data directory for config and the SQLite task database
    #[arg(long, env = "PLAND_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PLAND_LOG")]
    log: Option<String>,

    /// Bind address (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "PLAND_BIND")]
    bind_address: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon in the foreground (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Some(Command::Serve) | None => serve(args).await,
    }
}

async fn serve(args: Args) -> Result<()> {
    let config = Arc::new(DaemonConfig::load(
        args.port,
        args.data_dir,
        args.log,
        args.bind_address,
    ));

    let filter = EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        "pland starting"
    );

    let storage = Arc::new(TaskStorage::open(&config.data_dir).await?);
    let broker = Arc::new(ResultBroker::new());
    let inference = Arc::new(HttpInferenceClient::new(&config.inference)?);
    let registry = Arc::new(handlers::default_registry(
        Arc::clone(&storage),
        inference,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&storage),
        registry,
        Arc::clone(&broker),
        config.dispatcher.clone(),
    ));
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    let reaper_handle = tokio::spawn(reaper::run_reaper(
        Arc::clone(&storage),
        Arc::clone(&broker),
        config.dispatcher.clone(),
        shutdown_rx.clone(),
    ));

    let ctx = Arc::new(AppContext::new(Arc::clone(&config), storage, broker));
    let server = tokio::spawn(rest::start_rest_server(ctx, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received — draining");
    let _ = shutdown_tx.send(true);

    // Dispatcher drain is bounded internally by the shutdown grace period.
    let _ = dispatcher_handle.await;
    let _ = reaper_handle.await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(err = %e, "REST server exited with error"),
        Err(e) => warn!(err = %e, "REST server task panicked"),
    }

    info!("pland stopped");
    Ok(())
}
