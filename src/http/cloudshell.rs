// src/http/cloudshell.rs

//! `/cloudshell/*` routes (spec §6). §4.H's [MODULE] block specifies only
//! the reaper's scan-and-delete algorithm; it's silent on how a shell pod is
//! created in the first place, even though §6 lists the full CRUD surface.
//! This supplements that gap with a minimal pod lifecycle — the same
//! reasoning `http/credentials.rs` applies to the Credential Store's own
//! HTTP gap. The websocket terminal is exec (`core::exec`) pointed at the
//! shell pod's well-known container, not a distinct protocol.

use crate::core::errors::{ClusterMuxError, Result};
use crate::core::exec::ExecParams;
use crate::core::state::ServerState;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use k8s_openapi::api::core::v1::{ConfigMap, Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const CLOUDSHELL_LABEL_SELECTOR: &str = "app=cloudshell";
const SHELL_CONTAINER: &str = "shell";

#[derive(Debug, Deserialize)]
pub struct CloudShellQuery {
    pub credential: String,
    pub cluster: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateCloudShellRequest {
    pub namespace: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct CloudShellSummary {
    pub name: String,
    pub namespace: String,
    pub phase: Option<String>,
    pub created_at: Option<String>,
}

fn cloudshell_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), "cloudshell".to_string())])
}

/// `POST /cloudshell`.
pub async fn create(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<CloudShellQuery>,
    Json(req): Json<CreateCloudShellRequest>,
) -> Result<Json<CloudShellSummary>> {
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;

    if !req.config.is_empty() {
        let mut annotations = BTreeMap::new();
        annotations.insert("clustermux.dev/pod".to_string(), req.name.clone());
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(req.name.clone()),
                namespace: Some(req.namespace.clone()),
                labels: Some(cloudshell_labels()),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: Some(req.config.clone()),
            ..Default::default()
        };
        let cms: Api<ConfigMap> = Api::namespaced(cluster.client.clone(), &req.namespace);
        cms.create(&PostParams::default(), &cm).await.map_err(ClusterMuxError::from)?;
    }

    let pod = Pod {
        metadata: ObjectMeta {
            name: Some(req.name.clone()),
            namespace: Some(req.namespace.clone()),
            labels: Some(cloudshell_labels()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: SHELL_CONTAINER.to_string(),
                image: Some(req.image),
                stdin: Some(true),
                tty: Some(true),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    let pods: Api<Pod> = Api::namespaced(cluster.client.clone(), &req.namespace);
    let created = pods.create(&PostParams::default(), &pod).await.map_err(ClusterMuxError::from)?;
    Ok(Json(CloudShellSummary {
        name: created.metadata.name.unwrap_or_default(),
        namespace: created.metadata.namespace.unwrap_or_default(),
        phase: created.status.and_then(|s| s.phase),
        created_at: created.metadata.creation_timestamp.map(|t| t.0.to_rfc3339()),
    }))
}

/// `GET /cloudshell`.
pub async fn list(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<CloudShellQuery>,
) -> Result<Json<Vec<CloudShellSummary>>> {
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;
    let pods: Api<Pod> = Api::all(cluster.client.clone());
    let lp = ListParams::default().labels(CLOUDSHELL_LABEL_SELECTOR);
    let list = pods.list(&lp).await.map_err(ClusterMuxError::from)?;
    Ok(Json(
        list.items
            .into_iter()
            .map(|p| CloudShellSummary {
                name: p.metadata.name.unwrap_or_default(),
                namespace: p.metadata.namespace.unwrap_or_default(),
                phase: p.status.and_then(|s| s.phase),
                created_at: p.metadata.creation_timestamp.map(|t| t.0.to_rfc3339()),
            })
            .collect(),
    ))
}

/// `DELETE /cloudshell/:name`. The route carries no namespace, so this looks
/// the pod up by label+name first (cloud-shell pods are few and
/// short-lived, so a list-then-delete is cheap enough).
pub async fn delete(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Query(q): Query<CloudShellQuery>,
) -> Result<StatusCode> {
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;
    let pods: Api<Pod> = Api::all(cluster.client.clone());
    let lp = ListParams::default().labels(CLOUDSHELL_LABEL_SELECTOR);
    let list = pods.list(&lp).await.map_err(ClusterMuxError::from)?;
    let Some(pod) = list.items.into_iter().find(|p| p.metadata.name.as_deref() == Some(name.as_str())) else {
        return Err(ClusterMuxError::NotFound(format!("cloudshell {name}")));
    };
    let namespace = pod.metadata.namespace.unwrap_or_else(|| "default".to_string());
    let pods_ns: Api<Pod> = Api::namespaced(cluster.client.clone(), &namespace);
    pods_ns.delete(&name, &DeleteParams::default()).await.map_err(ClusterMuxError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /cloudshell/cleanup` — manual reaper trigger (spec §4.H: "returns
/// immediately, 202 initiated").
pub async fn cleanup(State(state): State<Arc<ServerState>>) -> StatusCode {
    state.cloudshell.trigger();
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
pub struct CloudShellWsQuery {
    pub credential: String,
    pub cluster: String,
    pub namespace: String,
    pub name: String,
}

/// `GET /cloudshell/ws`.
pub async fn ws(
    upgrade: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Query(q): Query<CloudShellWsQuery>,
) -> Result<Response> {
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;
    let params = ExecParams {
        namespace: q.namespace,
        pod_name: q.name,
        container: Some(SHELL_CONTAINER.to_string()),
        command: vec!["/bin/sh".to_string()],
        tty: true,
    };
    let client = cluster.client.clone();
    let cancel = state.root_cancel.child_token();
    Ok(upgrade.on_upgrade(move |socket| super::exec::bridge(socket, client, params, cancel)))
}
