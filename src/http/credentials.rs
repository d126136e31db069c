// src/http/credentials.rs

//! Credential management routes. Spec §6 doesn't enumerate an HTTP surface
//! for the Credential Store (4.A's `add`/`list`/`delete`/`get` operations
//! are named without a wire format), so this crate supplements it with a
//! minimal REST surface — the operations must be reachable somehow, and
//! every other component's HTTP routes assume credentials already exist.

use crate::core::credentials::{ClusterDescriptor, CredentialKind, CredentialSummary};
use crate::core::errors::Result;
use crate::core::state::ServerState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct AddCredentialRequest {
    pub display_name: String,
    pub kind: CredentialKind,
    /// Hex-encoded payload bytes, matching the on-disk encoding in
    /// `core/credentials/mod.rs`'s `serde_bytes_as_base64` module (named
    /// for its role, encoded as hex — see that module's doc comment).
    pub payload_hex: String,
    pub clusters: Vec<ClusterDescriptor>,
}

pub async fn add_credential(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<AddCredentialRequest>,
) -> Result<Json<serde_json::Value>> {
    let payload = hex::decode(&req.payload_hex)
        .map_err(|e| crate::core::errors::ClusterMuxError::Invalid(format!("invalid hex payload: {e}")))?;
    let id = state
        .credentials
        .add(req.display_name, req.kind, payload, req.clusters)?;
    Ok(Json(serde_json::json!({ "id": id })))
}

pub async fn list_credentials(State(state): State<Arc<ServerState>>) -> Json<Vec<CredentialSummary>> {
    Json(state.credentials.list())
}

pub async fn delete_credential(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    // `CredentialStore::delete` invokes the deletion hook registered in
    // `ServerState::initialize`, which cascades to the Client Factory and
    // Informer Registry.
    state.credentials.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_credential(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<CredentialSummary>> {
    let credential = state.credentials.get(&id)?;
    Ok(Json(CredentialSummary::from(credential.as_ref())))
}
