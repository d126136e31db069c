// src/http/exec.rs

//! `GET /pods/:ns/:name/exec/ws` (spec §6): translates axum's binary
//! WebSocket frames (a single leading stream-id byte, per spec's wire
//! format) into the core Exec Adapter's `InboundFrame`/`OutboundFrame` and
//! back, keeping `core::exec` itself transport-agnostic.

use crate::core::exec::{run_exec_session, ExecParams, InboundFrame, OutboundFrame, RateLimiter};
use crate::core::errors::Result;
use crate::core::state::ServerState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const STREAM_STDIN: u8 = 0;
const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;
const STREAM_EXIT: u8 = 3;
const STREAM_RESIZE: u8 = 4;

#[derive(Debug, Deserialize)]
pub struct ExecQuery {
    pub credential: String,
    pub cluster: String,
    pub container: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub tty: bool,
}

#[derive(Debug, Deserialize)]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Path((namespace, name)): Path<(String, String)>,
    Query(q): Query<ExecQuery>,
) -> Result<Response> {
    let cluster = state.clients.client_for(&q.credential, &q.cluster).await?;
    let command = if q.command.is_empty() {
        vec!["/bin/sh".to_string()]
    } else {
        q.command
    };
    let params = ExecParams {
        namespace,
        pod_name: name,
        container: q.container,
        command,
        tty: q.tty,
    };
    let client = cluster.client.clone();
    let cancel = state.root_cancel.child_token();
    Ok(ws.on_upgrade(move |socket| bridge(socket, client, params, cancel)))
}

/// Shared with `http/cloudshell.rs`'s websocket terminal, which is exec
/// against a well-known container rather than a distinct wire protocol.
pub(crate) async fn bridge(socket: WebSocket, client: kube::Client, params: ExecParams, cancel: CancellationToken) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(32);
    let rate_limiter = Arc::new(RateLimiter::new(1_000_000));

    let session = tokio::spawn(run_exec_session(
        client,
        params,
        cancel.clone(),
        inbound_rx,
        outbound_tx,
        rate_limiter,
    ));

    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if reader_cancel.is_cancelled() {
                break;
            }
            let Message::Binary(bytes) = msg else { continue };
            let Some((&tag, rest)) = bytes.split_first() else { continue };
            match tag {
                STREAM_STDIN => {
                    let data = String::from_utf8_lossy(rest).to_string();
                    if inbound_tx.send(InboundFrame::Stdin { data }).await.is_err() {
                        break;
                    }
                }
                STREAM_RESIZE => {
                    if let Ok(resize) = serde_json::from_slice::<ResizePayload>(rest) {
                        if inbound_tx
                            .send(InboundFrame::Resize { cols: resize.cols, rows: resize.rows })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
    });

    while let Some(frame) = outbound_rx.recv().await {
        let msg = match frame {
            OutboundFrame::Stream { stream, data } => {
                let tag = if stream == "stdout" { STREAM_STDOUT } else { STREAM_STDERR };
                let mut buf = vec![tag];
                buf.extend_from_slice(data.as_bytes());
                buf
            }
            OutboundFrame::Exit { code, .. } => {
                let mut buf = vec![STREAM_EXIT];
                buf.extend_from_slice(code.to_string().as_bytes());
                buf
            }
        };
        if ws_tx.send(Message::Binary(msg.into())).await.is_err() {
            break;
        }
    }

    cancel.cancel();
    reader.abort();
    if let Ok(Err(e)) = session.await {
        warn!(error = %e, "exec session ended with error");
    }
}
