// src/http/resource.rs

//! The generic resource endpoint (spec §6/§11): one handler table covering
//! list/detail/yaml/events/bulk-delete/apply for every registered kind,
//! instead of one hand-written handler per Kubernetes resource — the
//! "handler proliferation" collapse Design Notes §9 calls for.

use crate::core::client_factory::ClusterHandle;
use crate::core::errors::{ClusterMuxError, Result};
use crate::core::informer::{ClusterObject, InformerKey};
use crate::core::sse::Transform;
use crate::core::state::ServerState;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::Scope;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

/// Both branches of `list_stream`/`object_events` (a live data stream, or a
/// single permission-error frame) must share one concrete return type for
/// the `Sse<_>` response, since the two come from different underlying
/// stream constructors.
type BoxedSseStream = Pin<Box<dyn futures::Stream<Item = std::result::Result<Event, Infallible>> + Send>>;

/// Registration table entry. Only a handful of illustrative kinds are
/// registered; exhaustively covering every Kubernetes kind is the
/// explicitly out-of-scope "per-resource transformation functions" work
/// (spec §1 Out-of-scope).
#[derive(Debug, Clone, Copy)]
pub struct ResourceKindConfig {
    pub plural: &'static str,
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub namespaced: bool,
}

pub const RESOURCE_KINDS: &[ResourceKindConfig] = &[
    ResourceKindConfig {
        plural: "pods",
        group: "",
        version: "v1",
        kind: "Pod",
        namespaced: true,
    },
    ResourceKindConfig {
        plural: "configmaps",
        group: "",
        version: "v1",
        kind: "ConfigMap",
        namespaced: true,
    },
];

pub fn kind_config(plural: &str) -> Result<&'static ResourceKindConfig> {
    RESOURCE_KINDS
        .iter()
        .find(|k| k.plural == plural)
        .ok_or_else(|| ClusterMuxError::NotFound(format!("unknown resource kind {plural}")))
}

#[derive(Debug, Deserialize)]
pub struct ResourceQuery {
    pub credential: String,
    pub cluster: String,
}

/// Passes a cached object's JSON through untouched (`managedFields` is
/// already stripped at ingest, spec §4.C.4); both illustrative kinds share
/// this one transform rather than needing per-kind reshaping.
struct RawObjectTransform {
    kind: &'static str,
}

impl Transform for RawObjectTransform {
    fn event_name(&self) -> &'static str {
        self.kind
    }

    fn render(&self, objects: &[ClusterObject]) -> serde_json::Value {
        serde_json::Value::Array(
            objects
                .iter()
                .map(|o| serde_json::to_value(o.as_ref()).unwrap_or(serde_json::Value::Null))
                .collect(),
        )
    }
}

/// Filters a snapshot of `events` objects down to those whose
/// `involvedObject` names the one object this subscription cares about.
struct InvolvedObjectEventsTransform {
    namespace: String,
    name: String,
}

impl Transform for InvolvedObjectEventsTransform {
    fn event_name(&self) -> &'static str {
        "Event"
    }

    fn render(&self, objects: &[ClusterObject]) -> serde_json::Value {
        serde_json::Value::Array(
            objects
                .iter()
                .filter(|o| {
                    let Some(involved) = o.data.get("involvedObject") else {
                        return false;
                    };
                    let name_matches = involved.get("name").and_then(|v| v.as_str()) == Some(self.name.as_str());
                    let ns_matches = involved
                        .get("namespace")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        == self.namespace;
                    name_matches && ns_matches
                })
                .map(|o| serde_json::to_value(o.as_ref()).unwrap_or(serde_json::Value::Null))
                .collect(),
        )
    }
}

fn informer_key(q: &ResourceQuery, cfg: &ResourceKindConfig) -> InformerKey {
    InformerKey::new(&q.credential, &q.cluster, cfg.group, cfg.version, cfg.plural)
}

/// `GET /{resource-plural}` — SSE list stream (spec §6).
///
/// If the informer subscription fails with `PermissionDenied`, the
/// handshake still succeeds: the stream opens and its first (and only)
/// frame is the permission-error frame, rather than failing the HTTP
/// request outright (spec §4.E/S2).
pub async fn list_stream(
    State(state): State<Arc<ServerState>>,
    Path(plural): Path<String>,
    Query(q): Query<ResourceQuery>,
) -> Result<Sse<BoxedSseStream>> {
    let cfg = kind_config(&plural)?;
    let key = informer_key(&q, cfg);
    match state.informers.subscribe(key).await {
        Ok(sub) => {
            let transform: Arc<dyn Transform> = Arc::new(RawObjectTransform { kind: cfg.kind });
            Ok(Sse::new(Box::pin(state.sse.stream(sub, transform))))
        }
        Err(err @ ClusterMuxError::PermissionDenied { .. }) => {
            Ok(Sse::new(Box::pin(state.sse.permission_error_stream(&err))))
        }
        Err(other) => Err(other),
    }
}

/// `GET /{resource-plural}/:namespace/:name` — JSON detail.
///
/// The informer subscription only needs to outlive the lookup: it's dropped
/// at the end of the handler, which idle-closes the informer per spec §4.C
/// if no one else is watching this kind.
pub async fn detail(
    State(state): State<Arc<ServerState>>,
    Path((plural, namespace, name)): Path<(String, String, String)>,
    Query(q): Query<ResourceQuery>,
) -> Result<Json<serde_json::Value>> {
    let cfg = kind_config(&plural)?;
    let key = informer_key(&q, cfg);
    let sub = state.informers.subscribe(key.clone()).await?;
    let obj = state.informers.get(&key, &namespace, &name)?;
    drop(sub);
    Ok(Json(serde_json::to_value(obj.as_ref())?))
}

/// `GET /{resource-plural}/:namespace/:name/yaml`.
pub async fn detail_yaml(
    State(state): State<Arc<ServerState>>,
    Path((plural, namespace, name)): Path<(String, String, String)>,
    Query(q): Query<ResourceQuery>,
) -> Result<Response> {
    let cfg = kind_config(&plural)?;
    let key = informer_key(&q, cfg);
    let sub = state.informers.subscribe(key.clone()).await?;
    let obj = state.informers.get(&key, &namespace, &name)?;
    drop(sub);
    let yaml = serde_yaml::to_string(obj.as_ref())?;
    Ok(([(header::CONTENT_TYPE, "application/yaml")], yaml).into_response())
}

/// `GET /{resource-plural}/:namespace/:name/events` — SSE stream of
/// Kubernetes events referencing this object. Same permission-error
/// handshake fallback as `list_stream`.
pub async fn object_events(
    State(state): State<Arc<ServerState>>,
    Path((plural, namespace, name)): Path<(String, String, String)>,
    Query(q): Query<ResourceQuery>,
) -> Result<Sse<BoxedSseStream>> {
    kind_config(&plural)?; // validates the referencing kind is registered
    let key = InformerKey::new(&q.credential, &q.cluster, "", "v1", "events");
    match state.informers.subscribe(key).await {
        Ok(sub) => {
            let transform: Arc<dyn Transform> = Arc::new(InvolvedObjectEventsTransform { namespace, name });
            Ok(Sse::new(Box::pin(state.sse.stream(sub, transform))))
        }
        Err(err @ ClusterMuxError::PermissionDenied { .. }) => {
            Ok(Sse::new(Box::pin(state.sse.permission_error_stream(&err))))
        }
        Err(other) => Err(other),
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteTarget {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteFailure {
    pub namespace: Option<String>,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BulkDeleteResponse {
    pub failures: Vec<DeleteFailure>,
}

/// `DELETE /{resource-plural}` — bulk delete, bounded fan-out concurrency 8
/// (Open Question decision, DESIGN.md). 200 even on partial failure;
/// failures are conveyed in the body, never abort the batch.
pub async fn bulk_delete(
    State(state): State<Arc<ServerState>>,
    Path(plural): Path<String>,
    Query(q): Query<ResourceQuery>,
    Json(targets): Json<Vec<DeleteTarget>>,
) -> Result<Json<BulkDeleteResponse>> {
    let cfg = kind_config(&plural)?;
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;
    let gvk = GroupVersionKind::gvk(cfg.group, cfg.version, cfg.kind);
    let (ar, _caps) = cluster
        .discovery
        .resolve_gvk(&gvk)
        .ok_or_else(|| ClusterMuxError::NotFound(format!("no API resource for {plural}")))?;
    let namespaced = cfg.namespaced;
    let client = cluster.client.clone();

    let failures: Vec<DeleteFailure> = futures::stream::iter(targets)
        .map(|target| {
            let client = client.clone();
            let ar = ar.clone();
            async move {
                let api: Api<DynamicObject> = if namespaced {
                    let ns = target.namespace.clone().unwrap_or_else(|| "default".to_string());
                    Api::namespaced_with(client, &ns, &ar)
                } else {
                    Api::all_with(client, &ar)
                };
                match api.delete(&target.name, &DeleteParams::default()).await {
                    Ok(_) => None,
                    Err(e) => Some(DeleteFailure {
                        namespace: target.namespace,
                        name: target.name,
                        message: ClusterMuxError::from(e).to_string(),
                    }),
                }
            }
        })
        .buffer_unordered(8)
        .filter_map(|r| async move { r })
        .collect()
        .await;

    Ok(Json(BulkDeleteResponse { failures }))
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum ApplyOutcome {
    Created { kind: String, namespace: Option<String>, name: String },
    Updated { kind: String, namespace: Option<String>, name: String },
    Error { message: String },
}

fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// `POST /apply` — multi-document YAML, one create-or-update per document
/// via server-side apply. Per-object errors are collected rather than
/// aborting the rest of the batch.
pub async fn apply(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<ResourceQuery>,
    body: String,
) -> Result<Json<Vec<ApplyOutcome>>> {
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;
    let mut outcomes = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&body) {
        let value = match serde_json::Value::deserialize(doc) {
            Ok(serde_json::Value::Null) => continue,
            Ok(v) => v,
            Err(e) => {
                outcomes.push(ApplyOutcome::Error {
                    message: format!("invalid YAML document: {e}"),
                });
                continue;
            }
        };
        outcomes.push(apply_one(&cluster, value).await);
    }
    Ok(Json(outcomes))
}

async fn apply_one(cluster: &ClusterHandle, value: serde_json::Value) -> ApplyOutcome {
    let obj: DynamicObject = match serde_json::from_value(value) {
        Ok(o) => o,
        Err(e) => {
            return ApplyOutcome::Error {
                message: format!("invalid object: {e}"),
            }
        }
    };
    let Some(types) = obj.types.clone() else {
        return ApplyOutcome::Error {
            message: "object is missing apiVersion/kind".into(),
        };
    };
    let (group, version) = parse_api_version(&types.api_version);
    let gvk = GroupVersionKind::gvk(&group, &version, &types.kind);
    let Some((ar, caps)) = cluster.discovery.resolve_gvk(&gvk) else {
        return ApplyOutcome::Error {
            message: format!("unknown kind {}/{}", types.api_version, types.kind),
        };
    };
    let namespace = obj.metadata.namespace.clone();
    let name = obj.metadata.name.clone().unwrap_or_default();
    if name.is_empty() {
        return ApplyOutcome::Error {
            message: "object is missing metadata.name".into(),
        };
    }

    let api: Api<DynamicObject> = match (caps.scope, &namespace) {
        (Scope::Namespaced, Some(ns)) => Api::namespaced_with(cluster.client.clone(), ns, &ar),
        _ => Api::all_with(cluster.client.clone(), &ar),
    };
    let existed = api.get(&name).await.is_ok();
    let pp = PatchParams::apply("clustermux").force();
    match api.patch(&name, &pp, &Patch::Apply(&obj)).await {
        Ok(_) if existed => ApplyOutcome::Updated {
            kind: types.kind,
            namespace,
            name,
        },
        Ok(_) => ApplyOutcome::Created {
            kind: types.kind,
            namespace,
            name,
        },
        Err(e) => ApplyOutcome::Error {
            message: ClusterMuxError::from(e).to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_config_finds_registered_kind() {
        let cfg = kind_config("pods").unwrap();
        assert_eq!(cfg.kind, "Pod");
    }

    #[test]
    fn kind_config_rejects_unregistered_kind() {
        assert!(kind_config("widgets").is_err());
    }

    #[test]
    fn parse_api_version_splits_group_and_core() {
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(
            parse_api_version("apps/v1"),
            ("apps".to_string(), "v1".to_string())
        );
    }

    #[test]
    fn raw_object_transform_uses_registered_kind_as_event_name() {
        let t = RawObjectTransform { kind: "Pod" };
        assert_eq!(t.event_name(), "Pod");
        assert_eq!(t.render(&[]), serde_json::Value::Array(vec![]));
    }
}
