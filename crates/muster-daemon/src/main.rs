//! muster daemon -- starts the squad orchestration API server and the
//! approval-timeout sweeper.

use std::sync::Arc;

use anyhow::{Context, Result};
use muster_bridge::{api_router, scripted_factory, ApiState};
use muster_bus::BusClient;
use muster_core::config::Config;
use muster_core::identity::StaticIdentity;
use muster_core::store::{MemoryStore, SquadStore};
use tracing::info;

mod logging;
mod sweeper;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Load config before logging so the logging section can shape the
    // subscriber; the load warning is emitted right after init.
    let (config, load_err) = match Config::load() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };
    if config.logging.json {
        logging::init_logging_json("muster-daemon", &config.logging.filter);
    } else {
        logging::init_logging("muster-daemon", &config.logging.filter);
    }
    if let Some(e) = load_err {
        tracing::warn!(error = %e, "failed to load config, using defaults");
    }

    info!(version = env!("CARGO_PKG_VERSION"), "muster daemon starting");

    let store = MemoryStore::new();
    let approver_token =
        std::env::var("MUSTER_APPROVER_TOKEN").unwrap_or_else(|_| "dev-token".to_string());
    let identity = StaticIdentity::new().with_token(approver_token, "operator", "Operator");

    let state = Arc::new(ApiState::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(store),
        Arc::new(identity),
        BusClient::new(),
        config.execution.clone(),
        config.streaming.clone(),
        scripted_factory(),
    ));

    // Rebuild engine runtimes for squads already in the store.
    let squads = state
        .squads
        .list_squads()
        .await
        .context("failed to list squads at startup")?;
    for squad in squads {
        state.register_squad(squad);
    }

    tokio::spawn(sweeper::run_approval_sweeper(
        state.clone(),
        config.approvals.clone(),
    ));

    let app = api_router(state);
    let addr = format!("{}:{}", config.daemon.bind, config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("muster daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    info!("ctrl-c received, shutting down");
}
