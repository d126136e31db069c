// src/http/portforward.rs

//! `/portforward/*` routes (spec §6): opens a session on WS connect,
//! announces the assigned session id (and bound local port) in the first
//! text frame, then holds the socket open purely as a liveness signal — the
//! actual tunneled bytes flow over the plain TCP listener `core::portforward`
//! binds, not over this websocket.

use crate::core::errors::Result;
use crate::core::portforward::{PortForwardSession, PortForwardSummary};
use crate::core::state::ServerState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct PortForwardQuery {
    pub credential: String,
    pub cluster: String,
    pub namespace: String,
    pub pod: String,
    #[serde(rename = "remotePort")]
    pub remote_port: u16,
    #[serde(rename = "localPort")]
    pub local_port: Option<u16>,
}

pub async fn open_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Query(q): Query<PortForwardQuery>,
) -> Result<Response> {
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;
    let session = state
        .portforward
        .open(
            cluster.client.clone(),
            q.namespace,
            q.pod,
            q.remote_port,
            q.local_port,
            &state.root_cancel,
        )
        .await?;
    Ok(ws.on_upgrade(move |socket| hold_open(socket, session)))
}

async fn hold_open(mut socket: WebSocket, session: Arc<PortForwardSession>) {
    let announcement = serde_json::json!({
        "sessionId": session.id,
        "localPort": session.local_port(),
    });
    if socket
        .send(Message::Text(announcement.to_string().into()))
        .await
        .is_err()
    {
        session.cancel.cancel();
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            msg = socket.recv() => {
                if msg.is_none() {
                    break;
                }
            }
        }
    }
    session.cancel.cancel();
}

/// `GET /portforward/sessions`.
pub async fn list_sessions(State(state): State<Arc<ServerState>>) -> Json<Vec<PortForwardSummary>> {
    Json(state.portforward.list())
}

/// `DELETE /portforward/sessions/:id`.
pub async fn delete_session(State(state): State<Arc<ServerState>>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.portforward.cancel(id)?;
    Ok(StatusCode::NO_CONTENT)
}
