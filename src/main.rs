// =============================================================================
// Archer Execution Core — Main Entry Point
// =============================================================================
//
// Receives validated trading signals over HTTP, validates them per user,
// and installs entry + SL + TP triplets on the venue; a guardian endpoint
// lets an external monitor close or tighten live positions across the
// fleet.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod error;
mod exec;
mod fleet;
mod guardian;
mod market;
mod rules;
mod store;
mod types;
mod venue;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::ExecConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Archer Execution Core — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Configuration & shared state ──────────────────────────────────
    let config = ExecConfig::from_env();
    if config.testnet {
        warn!("TESTNET mode: orders route to the futures testnet host");
    }
    info!(
        users = config.users.len(),
        db_path = %config.db_path,
        bind_addr = %config.bind_addr,
        "configuration loaded"
    );

    let state = AppState::build(&config)?;

    // ── 3. Serve the execution API ───────────────────────────────────────
    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "execution API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            warn!("shutdown signal received — stopping gracefully");
        })
        .await?;

    info!("Archer Execution Core shut down complete.");
    Ok(())
}
