// tests/http_credentials.rs

//! End-to-end exercise of the `/credentials` HTTP surface against a real
//! `ServerState` (no live cluster needed — credential CRUD never dials
//! out). Mirrors the teacher's integration-style tests that drive a real
//! `ServerState` through its public commands rather than mocking it.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use clustermux::config::Config;
use clustermux::core::state::ServerState;
use std::sync::Arc;
use tower::ServiceExt;
use tracing_subscriber::{filter::EnvFilter, reload};

fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.data_dir = data_dir.to_string_lossy().to_string();
    config
}

fn log_reload_handle() -> Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>> {
    let (_, handle) = reload::Layer::new(EnvFilter::new("off"));
    Arc::new(handle)
}

#[tokio::test]
async fn add_list_get_delete_credential_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let init = ServerState::initialize(config, log_reload_handle()).unwrap();
    let router = clustermux::http::router(init.state.clone());

    let add_body = serde_json::json!({
        "display_name": "prod",
        "kind": "bearer",
        "payload_hex": hex::encode(b"s3cr3t-token"),
        "clusters": [{"name": "prod-east", "api_server_url": "https://k8s.example.com", "default_namespace": null}],
    });
    let add_req = Request::builder()
        .method("POST")
        .uri("/api/v1/credentials")
        .header("content-type", "application/json")
        .body(Body::from(add_body.to_string()))
        .unwrap();
    let add_resp = router.clone().oneshot(add_req).await.unwrap();
    assert_eq!(add_resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(add_resp.into_body(), usize::MAX).await.unwrap();
    let added: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let id = added["id"].as_str().unwrap().to_string();

    let list_req = Request::builder()
        .uri("/api/v1/credentials")
        .body(Body::empty())
        .unwrap();
    let list_resp = router.clone().oneshot(list_req).await.unwrap();
    assert_eq!(list_resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(list_resp.into_body(), usize::MAX).await.unwrap();
    let list: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["display_name"], "prod");

    let get_req = Request::builder()
        .uri(format!("/api/v1/credentials/{id}"))
        .body(Body::empty())
        .unwrap();
    let get_resp = router.clone().oneshot(get_req).await.unwrap();
    assert_eq!(get_resp.status(), StatusCode::OK);

    let delete_req = Request::builder()
        .method("DELETE")
        .uri(format!("/api/v1/credentials/{id}"))
        .body(Body::empty())
        .unwrap();
    let delete_resp = router.clone().oneshot(delete_req).await.unwrap();
    assert_eq!(delete_resp.status(), StatusCode::NO_CONTENT);

    let get_again_req = Request::builder()
        .uri(format!("/api/v1/credentials/{id}"))
        .body(Body::empty())
        .unwrap();
    let get_again_resp = router.clone().oneshot(get_again_req).await.unwrap();
    assert_eq!(get_again_resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_resource_plural_returns_not_found_style_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let init = ServerState::initialize(config, log_reload_handle()).unwrap();
    let router = clustermux::http::router(init.state.clone());

    let req = Request::builder()
        .uri("/api/v1/secrets?credential=nope&cluster=nope")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn state_initializes_cleanly_with_metrics_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.metrics.enabled = true;
    let init = ServerState::initialize(config, log_reload_handle()).unwrap();
    assert_eq!(init.state.traces.len(), 0);
    assert_eq!(init.state.credentials.list().len(), 0);
}
