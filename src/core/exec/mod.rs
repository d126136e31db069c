// src/core/exec/mod.rs

//! The WebSocket Exec Adapter (spec §4.F): bridges a browser terminal to a
//! pod's exec stream. Grounded on `other_examples/orka`'s `KubeOps::exec`
//! (TTY exec via `kube::api::AttachParams`, stdin/stdout/stderr pumps as
//! spawned tasks) generalized from a CLI terminal to a multiplexed WS wire
//! format, and on `core/tasks/eviction.rs`'s single-cancellation-token
//! fan-in style for tearing down the three cooperating tasks together.

use crate::core::errors::{ClusterMuxError, Result};
use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, TerminalSize};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub type ExecSessionId = Uuid;

/// Inbound browser frame, spec §6's websocket exec wire format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundFrame {
    Stdin { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Outbound frame to the browser.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Stream { stream: &'static str, data: String },
    Exit { r#type: &'static str, code: i32 },
}

/// Token-bucket style outbound rate limiter (spec §4.F: "rate-limited to a
/// configurable bytes/sec to prevent a runaway `yes` from saturating the
/// browser"). Hand-rolled rather than pulling in a new crate, since nothing
/// else in the pack reaches for a rate-limiting dependency.
pub struct RateLimiter {
    bytes_per_sec: u64,
    budget: parking_lot::Mutex<(u64, Instant)>,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            budget: parking_lot::Mutex::new((bytes_per_sec, Instant::now())),
        }
    }

    /// Blocks until `n` bytes' worth of budget is available.
    pub async fn acquire(&self, n: usize) {
        if self.bytes_per_sec == 0 {
            return;
        }
        loop {
            let wait = {
                let mut guard = self.budget.lock();
                let (tokens, last) = &mut *guard;
                let elapsed = last.elapsed();
                *last = Instant::now();
                *tokens = (*tokens + (elapsed.as_secs_f64() * self.bytes_per_sec as f64) as u64)
                    .min(self.bytes_per_sec);
                if *tokens >= n as u64 {
                    *tokens -= n as u64;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (n as u64 - *tokens) as f64 / self.bytes_per_sec as f64,
                    ))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

pub struct ExecParams {
    pub namespace: String,
    pub pod_name: String,
    pub container: Option<String>,
    pub command: Vec<String>,
    pub tty: bool,
}

/// Drives one exec session: opens the upstream exec stream and relays bytes
/// in both directions until `cancel` fires or either side closes.
pub async fn run_exec_session(
    client: Client,
    params: ExecParams,
    cancel: CancellationToken,
    mut inbound: mpsc::Receiver<InboundFrame>,
    outbound: mpsc::Sender<OutboundFrame>,
    rate_limiter: Arc<RateLimiter>,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client, &params.namespace);
    let mut ap = AttachParams::default()
        .stdin(true)
        .stdout(true)
        .stderr(!params.tty)
        .tty(params.tty);
    if let Some(c) = &params.container {
        ap = ap.container(c);
    }

    let mut attached = pods
        .exec(&params.pod_name, params.command.clone(), &ap)
        .await
        .map_err(ClusterMuxError::from)?;

    let mut stdin_writer = attached.stdin();
    let stdout_reader = attached.stdout();
    let stderr_reader = attached.stderr();
    let resize_tx = attached.terminal_size();

    let stdin_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                match frame {
                    InboundFrame::Stdin { data } => {
                        if let Some(writer) = stdin_writer.as_mut() {
                            // One chunk at a time, no extra buffering (spec
                            // §4.F: bounds memory under a pasted megabyte blob).
                            if writer.write_all(data.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    }
                    InboundFrame::Resize { cols, rows } => {
                        if let Some(tx) = &resize_tx {
                            let _ = tx.send(TerminalSize { width: cols, height: rows });
                        }
                    }
                }
            }
        })
    };

    let stdout_task = spawn_reader_pump(stdout_reader, "stdout", outbound.clone(), rate_limiter.clone(), cancel.clone());
    let stderr_task = spawn_reader_pump(stderr_reader, "stderr", outbound.clone(), rate_limiter, cancel.clone());

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = stdout_task => {}
        _ = stderr_task => {}
    }
    cancel.cancel();
    stdin_task.abort();

    // `take_status` returns a future resolving once the process exits;
    // best-effort per spec §4.F ("final exit frame is best-effort").
    let code = match attached.take_status() {
        Some(fut) => tokio::time::timeout(Duration::from_millis(500), fut)
            .await
            .ok()
            .flatten()
            .and_then(|status| status.status)
            .map(|s| if s == "Success" { 0 } else { 1 })
            .unwrap_or(0),
        None => 0,
    };

    let _ = outbound.send(OutboundFrame::Exit { r#type: "exit", code }).await;
    debug!(pod = %params.pod_name, "exec session ended");
    Ok(())
}

fn spawn_reader_pump(
    reader: Option<impl futures::AsyncRead + Unpin + Send + 'static>,
    stream_name: &'static str,
    outbound: mpsc::Sender<OutboundFrame>,
    rate_limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut reader) = reader else { return };
        let mut buf = [0u8; 8192];
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                n = reader.read(&mut buf) => {
                    match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            rate_limiter.acquire(n).await;
                            let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                            if outbound.send(OutboundFrame::Stream { stream: stream_name, data: chunk }).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_burst_up_to_budget() {
        let rl = RateLimiter::new(1_000_000);
        let start = Instant::now();
        rl.acquire(500).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn unlimited_rate_limiter_never_blocks_synchronously() {
        let rl = RateLimiter::new(0);
        assert_eq!(rl.bytes_per_sec, 0);
    }
}
