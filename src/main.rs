use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

use transit_relay::config::{generate_config_template, Config};
use transit_relay::proto::{self, outbound};
use transit_relay::reaper;
use transit_relay::routes;
use transit_relay::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "transit_relay=info".parse().expect("valid filter")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "transit_relay=info".parse().expect("valid filter")),
            )
            .init();
    }

    tracing::info!("transit-relay v{} starting", env!("CARGO_PKG_VERSION"));

    let state = AppState::new(config.clone());

    // Periodic reaper: transport reconciliation, stale purge, bucket expiry
    let reaper_handle = reaper::spawn(state.clone());

    // Build router
    let app = routes::build_router(state.clone());

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    reaper_handle.abort();
    tracing::info!("transit-relay stopped");

    Ok(())
}

/// Wait for ctrl-c, then run the drain sequence: every live driver enters
/// the grace substate, all connections hear `serverShutdown`, and the
/// notice gets a brief settle interval before the listener closes.
async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received, draining");

    state.registry.mark_all_disconnected(Instant::now());

    let notice = outbound::server_shutdown(proto::now_ms());
    for entry in state.connections.iter() {
        let _ = entry.value().send(notice.clone());
    }

    tokio::time::sleep(Duration::from_millis(state.config.shutdown_settle_ms)).await;
}
