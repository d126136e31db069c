// src/http/logs.rs

//! `GET /pods/:ns/:name/logs/ws` (spec §6): streams container logs over a
//! websocket. Thin enough over `kube::Api::log_stream` that it doesn't
//! warrant its own `core::` adapter the way exec and port-forward do.

use crate::core::errors::Result;
use crate::core::state::ServerState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub credential: String,
    pub cluster: String,
}

/// The client's first text frame, per spec §6.
#[derive(Debug, Deserialize, Default)]
struct LogsRequest {
    #[serde(default)]
    containers: Vec<String>,
    tail: Option<i64>,
    #[serde(rename = "sinceSeconds")]
    since_seconds: Option<i64>,
    #[serde(default)]
    follow: bool,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path((namespace, name)): Path<(String, String)>,
    Query(q): Query<LogsQuery>,
) -> Result<Response> {
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;
    let client = cluster.client.clone();
    Ok(ws.on_upgrade(move |socket| stream_logs(socket, client, namespace, name)))
}

async fn stream_logs(mut socket: WebSocket, client: kube::Client, namespace: String, name: String) {
    let Some(Ok(Message::Text(first))) = socket.next().await else {
        return;
    };
    let req: LogsRequest = serde_json::from_str(&first).unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client, &namespace);
    let containers: Vec<Option<String>> = if req.containers.is_empty() {
        vec![None]
    } else {
        req.containers.into_iter().map(Some).collect()
    };

    for container in containers {
        let params = LogParams {
            container,
            follow: req.follow,
            tail_lines: req.tail,
            since_seconds: req.since_seconds,
            ..Default::default()
        };
        let stream = match pods.log_stream(&name, &params).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = socket.send(Message::Text(format!("error: {e}").into())).await;
                continue;
            }
        };
        let mut lines = stream.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if socket.send(Message::Text(line.into())).await.is_err() {
                        debug!(pod = %name, "logs websocket closed mid-stream");
                        return;
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }
}
