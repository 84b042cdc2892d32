//! Metrics endpoint.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::hub::ObservabilityHub;
use crate::signal::ShutdownToken;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn router(hub: Arc<ObservabilityHub>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/status", get(get_status))
        .with_state(hub)
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics endpoint to {}", addr))
}

/// Serve until shutdown is requested
pub async fn serve(
    listener: TcpListener,
    hub: Arc<ObservabilityHub>,
    mut shutdown: ShutdownToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Metrics endpoint listening on http://{}/metrics", addr);
    }
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics endpoint failed")
}

async fn get_metrics(State(hub): State<Arc<ObservabilityHub>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], hub.render())
}

async fn get_status(State(hub): State<Arc<ObservabilityHub>>) -> impl IntoResponse {
    Json(hub.snapshot())
}
