//! Portfolio Stream Binary
//!
//! Starts the market data connection and portfolio pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin portfolio-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `STREAM_URL`: WebSocket URL of the market data server
//!
//! ## Optional
//! - `STREAM_RECONNECT_ATTEMPTS`: Max reconnect attempts (default: 5)
//! - `STREAM_RECONNECT_BASE_DELAY_MS`: First backoff delay (default: 1000)
//! - `STREAM_RECONNECT_CAP_DELAY_MS`: Backoff cap (default: 30000)
//! - `STREAM_HEARTBEAT_INTERVAL_MS`: Heartbeat cadence (default: 30000)
//! - `STREAM_CONNECTION_TIMEOUT_MS`: Transport open timeout (default: 10000)
//! - `STREAM_FLUSH_INTERVAL_MS`: Price queue flush cadence (default: 1000)
//! - `STREAM_SNAPSHOT_REFRESH_INTERVAL_MS`: Snapshot republication cadence
//!   (default: 0 = disabled)
//! - `STREAM_SYMBOLS`: Comma-separated symbols to subscribe at startup
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;

use anyhow::{Context, Result};
use portfolio_stream::infrastructure::telemetry;
use portfolio_stream::{
    ConnectionState, DataKind, MarketDataService, PortfolioSnapshot, ServiceConfig,
    linear_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();
    telemetry::init();

    tracing::info!("Starting portfolio stream");

    let config = ServiceConfig::from_env().context("failed to load configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let service = MarketDataService::start(
        &config,
        PortfolioSnapshot::empty(),
        linear_metrics(),
        Arc::new(portfolio_stream::NullObserver),
        shutdown_token.clone(),
    );

    // Startup subscriptions land in the registry before the first connect,
    // so the post-connect replay covers them.
    let symbols = startup_symbols();
    if !symbols.is_empty() {
        service
            .subscribe(symbols, DataKind::All)
            .await
            .context("failed to register startup subscriptions")?;
    }

    if let Err(error) = service.connect().await {
        tracing::error!(error = %error, "initial connect failed");
    }

    // Log state transitions and snapshot publications until shutdown.
    spawn_state_logger(&service, shutdown_token.clone());
    spawn_snapshot_logger(&service, shutdown_token.clone());

    tracing::info!("Portfolio stream ready");

    await_shutdown().await;

    service.shutdown().await;
    tracing::info!("Portfolio stream stopped");
    Ok(())
}

/// Parse `STREAM_SYMBOLS` into a symbol list.
fn startup_symbols() -> Vec<String> {
    std::env::var("STREAM_SYMBOLS")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_uppercase)
                .collect()
        })
        .unwrap_or_default()
}

/// Log connection state transitions.
fn spawn_state_logger(service: &Arc<MarketDataService>, cancel: CancellationToken) {
    let mut states = service.connection_states();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow();
                    match state {
                        ConnectionState::Failed => {
                            tracing::error!("connection failed; manual reconnect required");
                        }
                        other => tracing::info!(state = other.as_str(), "connection state"),
                    }
                }
            }
        }
    });
}

/// Log aggregate metrics on each snapshot publication.
fn spawn_snapshot_logger(service: &Arc<MarketDataService>, cancel: CancellationToken) {
    let mut snapshots = service.snapshot_changes();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow().clone();
                    let aggregates = snapshot.aggregates();
                    tracing::info!(
                        positions = snapshot.len(),
                        total_value = %aggregates.total_value,
                        total_pnl = %aggregates.total_pnl,
                        total_pnl_pct = %aggregates.total_pnl_pct,
                        "snapshot published"
                    );
                }
            }
        }
    });
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    tracing::info!(
        url = %config.connection.url,
        reconnect_attempts = config.connection.reconnect_attempts,
        heartbeat_interval_ms = config.connection.heartbeat_interval.as_millis(),
        flush_interval_ms = config.pipeline.flush_interval.as_millis(),
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
