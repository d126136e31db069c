// src/server/metrics_server.rs

use crate::core::metrics::{gather_metrics, COALESCER_TRACKED_KEYS, TRACE_RING_SIZE};
use crate::core::state::ServerState;
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Handles HTTP requests to the /metrics endpoint.
///
/// Updates gauges that change frequently before gathering all registered
/// metrics and encoding them in the Prometheus text format.
async fn metrics_handler(state: Arc<ServerState>) -> impl IntoResponse {
    COALESCER_TRACKED_KEYS.set(state.coalescer.tracked_key_count() as f64);
    TRACE_RING_SIZE.set(state.traces.len() as f64);

    let body = gather_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

/// Runs a simple HTTP server to expose Prometheus metrics on /metrics.
pub async fn run_metrics_server(state: Arc<ServerState>, cancel: CancellationToken) {
    let port = state.config.metrics.port;

    let app = Router::new().route("/metrics", get(move || metrics_handler(state.clone())));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on port {}: {}", port, e);
            return;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("Metrics server shutting down.");
        })
        .await
        .unwrap();
}
