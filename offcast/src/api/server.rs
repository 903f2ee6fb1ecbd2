//! Router assembly and the HTTP server entry point.

use crate::api::routes;
use crate::manager::DownloadManager;
use crate::retention::StreamLeases;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DownloadManager>,
    pub leases: Arc<StreamLeases>,
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/downloads", routes::downloads::router())
        .nest("/api/health", routes::health::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until the token fires.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "API server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}
