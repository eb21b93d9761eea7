//! wattbench -- network-load vs. power-draw test bench for devices under test.
//!
//! This crate provides the test-execution engine: a three-phase runner
//! (idle baseline, load, idle tail), a multi-interface packet generator
//! with precise per-interface rate control and ramping, an
//! event-interleaved telemetry pipeline, and the SQLite run store behind
//! the control API.

pub mod api;
pub mod config;
pub mod loadgen;
pub mod netif;
pub mod power;
pub mod runner;
pub mod storage;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Start the wattbench daemon: control API, telemetry stream, run store.
pub async fn serve(settings: config::Settings) -> Result<()> {
    let power = power::from_settings(&settings)?;

    // A failing probe is worth knowing about at startup, but sampling
    // retries every tick anyway.
    let probe = {
        let power = Arc::clone(&power);
        tokio::task::spawn_blocking(move || power.probe()).await?
    };
    if let Err(e) = probe {
        warn!(error = %e, "power source probe failed; reads will retry during sampling");
    }

    info!(db_path = %settings.db_path, "initializing run store");
    let pool = storage::open_pool(&settings.db_path)?;
    let store = storage::RunStore::new(pool);

    let runner = Arc::new(runner::Runner::new(Arc::clone(&power)));
    let stream = Arc::new(telemetry::BroadcastSink::new(64));

    let state = api::AppState {
        runner,
        store,
        power,
        stream,
    };

    let addr: std::net::SocketAddr = settings
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {:?}", settings.listen_addr))?;
    let app = api::router(state);

    info!(%addr, "wattbench listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
