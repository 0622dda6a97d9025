//! rmc-coord - Measurement coordination service
//!
//! Drives loudspeaker measurement sweeps on an external measurement device,
//! listens for the device's webhook callbacks, and serves the UI boundary
//! (control routes + SSE) on the same port.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rmc_common::config::RmcConfig;
use rmc_common::events::EventBus;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rmc_coord::device::{MeasurementDevice, RewClient};
use rmc_coord::metrics::UnscoredEvaluator;
use rmc_coord::playback::player_from_config;
use rmc_coord::{AppState, SessionController};

/// Events buffered per SSE subscriber before it starts lagging
const EVENT_BUS_CAPACITY: usize = 256;

/// Command-line arguments for rmc-coord
#[derive(Parser, Debug)]
#[command(name = "rmc-coord")]
#[command(about = "Measurement coordination service")]
#[command(version)]
struct Args {
    /// Configuration file (overrides RMC_CONFIG and the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "RMC_PORT")]
    port: Option<u16>,

    /// Measurement device API base URL
    #[arg(long, env = "RMC_DEVICE_URL")]
    device_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        RmcConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(url) = args.device_url {
        config.device.base_url = url;
    }
    config.validate().context("Invalid configuration")?;

    // Initialize tracing
    let default_filter = format!(
        "rmc_coord={level},rmc_common={level},tower_http=info",
        level = config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting rmc-coord v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!("Measurement device: {}", config.device.base_url);
    info!("Playback backend: {:?}", config.playback.backend);

    let device = Arc::new(
        RewClient::new(&config.device).context("Failed to build measurement device client")?,
    );
    if config.device.subscribe_on_startup {
        let callback = config.server.webhook_url();
        match device.subscribe(&callback).await {
            Ok(()) => info!("Subscribed to device callbacks at {}", callback),
            Err(e) => warn!("Device subscription failed (will rely on a later subscribe): {}", e),
        }
    }

    let player = player_from_config(&config.playback);
    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    let session = Arc::new(SessionController::new(
        device,
        player,
        Arc::new(UnscoredEvaluator),
        event_bus,
        Arc::new(config),
    ));
    let state = AppState::new(Arc::clone(&session));
    let app = rmc_coord::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if session.abort().await {
        info!("Aborted the running session on shutdown");
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
