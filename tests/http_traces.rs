// tests/http_traces.rs

//! Exercises the `/traces` gap-fill routes end-to-end against a real
//! `ServerState` with spans ingested directly into the `TraceRing` (no
//! cluster needed — trace ingestion is purely in-process).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use clustermux::config::Config;
use clustermux::core::state::ServerState;
use clustermux::core::trace::{SpanStatus, TraceSpan};
use std::sync::Arc;
use tower::ServiceExt;
use tracing_subscriber::{filter::EnvFilter, reload};

fn log_reload_handle() -> Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>> {
    let (_, handle) = reload::Layer::new(EnvFilter::new("off"));
    Arc::new(handle)
}

fn sample_span(service: &str, status: SpanStatus) -> TraceSpan {
    TraceSpan {
        trace_id: "trace-1".to_string(),
        span_id: uuid::Uuid::new_v4().to_string(),
        parent_id: None,
        service: service.to_string(),
        operation: "list_pods".to_string(),
        start: Utc::now(),
        duration: std::time::Duration::from_millis(42),
        attributes: Default::default(),
        status,
    }
}

#[tokio::test]
async fn query_and_export_return_ingested_spans() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = dir.path().to_string_lossy().to_string();
    let init = ServerState::initialize(config, log_reload_handle()).unwrap();
    let state = init.state.clone();

    state.traces.ingest(sample_span("informer-registry", SpanStatus::Ok));
    state.traces.ingest(sample_span("sse-hub", SpanStatus::Error));

    let router = clustermux::http::router(state.clone());

    let query_req = Request::builder()
        .uri("/api/v1/traces")
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(query_req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let page: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(page["spans"].as_array().unwrap().len(), 2);

    let filtered_req = Request::builder()
        .uri("/api/v1/traces?status=error")
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(filtered_req).await.unwrap();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let page: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(page["spans"].as_array().unwrap().len(), 1);
    assert_eq!(page["spans"][0]["service"], "sse-hub");

    let export_req = Request::builder()
        .uri("/api/v1/traces/export?format=json")
        .body(Body::empty())
        .unwrap();
    let resp = router.clone().oneshot(export_req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let map_req = Request::builder()
        .uri("/api/v1/traces/service-map")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(map_req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn otlp_export_is_an_explicit_unimplemented_seam() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = dir.path().to_string_lossy().to_string();
    let init = ServerState::initialize(config, log_reload_handle()).unwrap();
    let router = clustermux::http::router(init.state.clone());

    let req = Request::builder()
        .uri("/api/v1/traces/export?format=otlp")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
