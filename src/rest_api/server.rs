//! Axum HTTP server for the operator endpoints

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers;
use crate::{Error, Result};

/// Routes served by the operator
fn router() -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until the process exits
pub async fn run_server(addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router())
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
