//! offcast - Offline HLS Downloader
//!
//! Pulls transcoded HLS streams from an upstream media server into single
//! resumable MP4 files, with a bounded download queue, crash recovery, and
//! time-based retention.

use std::sync::Arc;

use offcast::api::{AppState, server};
use offcast::logging::init_logging;
use offcast::manager::{DownloadManager, ManagerOptions};
use offcast::retention::{StreamLeases, spawn_sweeper};
use offcast::session::SessionStore;
use offcast::settings::Settings;
use offcast::upstream::HttpMediaServer;
use saveio_engine::FfmpegRemuxer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    dotenvy::dotenv().ok();

    info!("Starting offcast v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::from_env()?;
    info!(
        downloads_dir = %settings.downloads_dir.display(),
        max_concurrent = settings.max_concurrent_downloads,
        "Settings loaded"
    );

    // Load persisted sessions; downloads interrupted by the previous run
    // come back as Failed and can be resumed by the client.
    let store = Arc::new(SessionStore::load(&settings.downloads_dir).await?);

    let upstream = Arc::new(HttpMediaServer::new(
        &settings.upstream_url,
        settings.upstream_api_key.clone(),
        reqwest::Client::new(),
    )?);

    let manager = DownloadManager::new(
        store.clone(),
        upstream,
        Arc::new(FfmpegRemuxer::new()),
        ManagerOptions {
            max_concurrent_downloads: settings.max_concurrent_downloads,
            default_retention_days: settings.default_retention_days,
            engine: settings.engine_config(),
        },
    );

    // Pick up sessions that were still queued when the last run stopped.
    manager.schedule().await;

    let shutdown = CancellationToken::new();
    let leases = Arc::new(StreamLeases::default());
    let sweeper = spawn_sweeper(
        store.clone(),
        leases.clone(),
        settings.default_retention_days,
        settings.sweep_interval,
        shutdown.clone(),
    );

    let state = AppState {
        manager: manager.clone(),
        leases,
    };
    let server_token = shutdown.clone();
    let server_task =
        tokio::spawn(
            async move { server::serve(state, settings.bind_addr, server_token).await },
        );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    shutdown.cancel();
    manager.shutdown().await;
    let _ = sweeper.await;
    if let Err(e) = server_task.await? {
        error!("API server error during shutdown: {e}");
    }

    info!("offcast shutdown complete");
    Ok(())
}

/// Wait for SIGTERM signal (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

/// Wait for SIGTERM signal (non-Unix: wait forever, Ctrl+C handles it).
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
