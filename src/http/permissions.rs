// src/http/permissions.rs

//! `GET /permissions/check` (spec §6): an RBAC preflight backed by
//! Kubernetes's own `SelfSubjectAccessReview`, the same mechanism `kubectl
//! auth can-i` uses — no RBAC logic is reimplemented here.

use crate::core::errors::Result;
use crate::core::state::ServerState;
use axum::extract::{Query, State};
use axum::Json;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct PermissionQuery {
    pub credential: String,
    pub cluster: String,
    pub verb: String,
    pub resource: String,
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PermissionResponse {
    pub allowed: bool,
    pub reason: Option<String>,
}

pub async fn check(
    State(state): State<Arc<ServerState>>,
    Query(q): Query<PermissionQuery>,
) -> Result<Json<PermissionResponse>> {
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;
    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                verb: Some(q.verb),
                resource: Some(q.resource),
                namespace: q.namespace,
                ..Default::default()
            }),
            non_resource_attributes: None,
        },
        ..Default::default()
    };
    let api: Api<SelfSubjectAccessReview> = Api::all(cluster.client.clone());
    let result = api.create(&PostParams::default(), &review).await.map_err(crate::core::errors::ClusterMuxError::from)?;
    let status = result.status.unwrap_or_default();
    Ok(Json(PermissionResponse {
        allowed: status.allowed,
        reason: status.reason,
    }))
}
