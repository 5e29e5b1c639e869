mod audio;
mod chat;
mod config;
mod control;
mod error;
mod events;
mod files;
mod protocol;
mod registry;
mod rooms;
mod screen;
mod video;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audio::AudioServer;
use crate::config::{Config, SHUTDOWN_JOIN_TIMEOUT};
use crate::control::ControlServer;
use crate::error::RelayResult;
use crate::files::FileServer;
use crate::registry::ConnectionRegistry;
use crate::screen::ScreenServer;
use crate::video::VideoServer;

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Load .env before reading LANRELAY_LOG_LEVEL.
    let _ = dotenvy::dotenv();
    let log_level = std::env::var("LANRELAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let config = Config::from_env();

    if let Err(e) = serve(config).await {
        error!(error = %e, "fatal server error");
        std::process::exit(1);
    }
}

// ─── Orchestration ──────────────────────────────────────────────────────────

/// Bind all six listeners, spawn their tasks plus the heartbeat loop, and
/// block until Ctrl+C.  A bind failure is fatal and propagates out.
async fn serve(config: Config) -> RelayResult<()> {
    let registry = ConnectionRegistry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let control = ControlServer::bind(&config, registry.clone(), shutdown_rx.clone()).await?;
    let files = FileServer::bind(&config, registry.clone(), shutdown_rx.clone()).await?;
    let screen = ScreenServer::bind(&config, shutdown_rx.clone()).await?;
    let video = VideoServer::bind(&config, registry.clone(), shutdown_rx.clone()).await?;
    let audio = AudioServer::bind(&config, registry.clone(), shutdown_rx.clone()).await?;

    let heartbeat = tokio::spawn(registry.clone().run_heartbeat(shutdown_rx.clone()));
    tokio::spawn(control.run());
    tokio::spawn(files.run());
    tokio::spawn(screen.run());
    tokio::spawn(video.run());
    tokio::spawn(audio.run());

    info!("all services started; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Flip the running flag; listeners wake from their timeouts and exit.
    let _ = shutdown_tx.send(true);
    if timeout(SHUTDOWN_JOIN_TIMEOUT, heartbeat).await.is_err() {
        warn!("heartbeat loop did not stop in time");
    }

    info!(members = registry.member_count(), "server stopped");
    Ok(())
}
