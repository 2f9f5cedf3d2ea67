//! Liveness endpoint.

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;

pub const HEALTH_MESSAGE: &str = "Service is up and running!";

pub fn create_router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> &'static str {
    HEALTH_MESSAGE
}

/// Bind `addr` and serve the liveness endpoint until the task is dropped.
pub async fn serve(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", addr))?;
    serve_listener(listener).await
}

pub async fn serve_listener(listener: TcpListener) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Health endpoint listening");
    axum::serve(listener, create_router())
        .await
        .context("Health endpoint stopped")
}
