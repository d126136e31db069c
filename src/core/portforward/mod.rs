// src/core/portforward/mod.rs

//! The WebSocket Port-Forward Adapter (spec §4.G): one local TCP listener per
//! session tunneled to a remote pod port via `kube::Api::portforward`, the
//! same upstream call `other_examples/orka`'s `KubeOps::pf_internal` uses.
//! The session registry is a process-global `DashMap`, mutex-free except
//! around insert/lookup/remove (spec §5e) — `DashMap`'s sharding gives this
//! for free, the structural choice the teacher makes for its
//! `replica_states` map.

use crate::core::errors::{ClusterMuxError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

pub struct PortForwardSession {
    pub id: SessionId,
    pub pod: String,
    pub namespace: String,
    pub remote_port: u16,
    local_port: AtomicU16,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub started_at: DateTime<Utc>,
    closing: AtomicBool,
    pub cancel: CancellationToken,
}

impl PortForwardSession {
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        if self.cancel.is_cancelled() {
            if self.closing.load(Ordering::SeqCst) {
                SessionState::Closing
            } else {
                SessionState::Closed
            }
        } else {
            SessionState::Open
        }
    }

    pub fn summary(&self) -> PortForwardSummary {
        PortForwardSummary {
            id: self.id,
            pod: self.pod.clone(),
            local_port: self.local_port(),
            remote_port: self.remote_port,
            bytes_in: self.bytes_in.load(Ordering::SeqCst),
            bytes_out: self.bytes_out.load(Ordering::SeqCst),
            started_at: self.started_at,
            state: self.state(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PortForwardSummary {
    pub id: SessionId,
    pub pod: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
}

#[derive(Default)]
pub struct PortForwardRegistry {
    sessions: DashMap<SessionId, Arc<PortForwardSession>>,
}

impl PortForwardRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn list(&self) -> Vec<PortForwardSummary> {
        self.sessions.iter().map(|e| e.summary()).collect()
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<PortForwardSession>> {
        self.sessions
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| ClusterMuxError::NotFound(format!("portforward session {id}")))
    }

    pub fn cancel(&self, id: SessionId) -> Result<()> {
        let session = self.get(id)?;
        session.closing.store(true, Ordering::SeqCst);
        session.cancel.cancel();
        Ok(())
    }

    /// Opens a new session: binds a local listener (ephemeral if
    /// `local_port` is `None`), registers it, and spawns the accept loop.
    pub async fn open(
        self: &Arc<Self>,
        client: Client,
        namespace: String,
        pod: String,
        remote_port: u16,
        local_port: Option<u16>,
        parent_cancel: &CancellationToken,
    ) -> Result<Arc<PortForwardSession>> {
        let bind_addr = format!("127.0.0.1:{}", local_port.unwrap_or(0));
        let listener = TcpListener::bind(&bind_addr).await?;
        let actual_port = listener.local_addr()?.port();

        let session = Arc::new(PortForwardSession {
            id: Uuid::new_v4(),
            pod: pod.clone(),
            namespace: namespace.clone(),
            remote_port,
            local_port: AtomicU16::new(actual_port),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            started_at: Utc::now(),
            closing: AtomicBool::new(false),
            cancel: parent_cancel.child_token(),
        });

        self.sessions.insert(session.id, session.clone());
        info!(session = %session.id, pod = %pod, local_port = actual_port, remote_port, "port-forward session opened");

        let registry = self.clone();
        let session_task = session.clone();
        tokio::spawn(async move {
            accept_loop(client, namespace, pod, listener, session_task.clone()).await;
            registry.sessions.remove(&session_task.id);
            debug!(session = %session_task.id, "port-forward session closed");
        });

        Ok(session)
    }
}

async fn accept_loop(
    client: Client,
    namespace: String,
    pod: String,
    listener: TcpListener,
    session: Arc<PortForwardSession>,
) {
    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((tcp_stream, _addr)) = accepted else { break };
                let client = client.clone();
                let namespace = namespace.clone();
                let pod = pod.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(e) = bridge_connection(client, namespace, pod, tcp_stream, session).await {
                        warn!(error = %e, "port-forward connection error");
                    }
                });
            }
        }
    }
}

async fn bridge_connection(
    client: Client,
    namespace: String,
    pod: String,
    mut tcp_stream: tokio::net::TcpStream,
    session: Arc<PortForwardSession>,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client, &namespace);
    let mut pf = pods
        .portforward(&pod, &[session.remote_port])
        .await
        .map_err(ClusterMuxError::from)?;
    let remote = pf
        .take_stream(session.remote_port)
        .ok_or_else(|| ClusterMuxError::Unavailable("no stream for forwarded port".into()))?;

    // Split both sides once up front; each direction then owns one half and
    // counts its own bytes independently (spec testable property #10).
    let (mut tcp_read, mut tcp_write) = tcp_stream.split();
    let (mut remote_read, mut remote_write_half) = tokio::io::split(remote);
    let cancel = session.cancel.clone();

    let to_remote = {
        let bytes_in = &session.bytes_in;
        async {
            let mut buf = [0u8; 8192];
            loop {
                match tcp_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        bytes_in.fetch_add(n as u64, Ordering::SeqCst);
                        if remote_write_half.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = remote_write_half.shutdown().await;
        }
    };

    let from_remote = {
        let bytes_out = &session.bytes_out;
        async {
            let mut buf = [0u8; 8192];
            loop {
                match remote_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        bytes_out.fetch_add(n as u64, Ordering::SeqCst);
                        if tcp_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = to_remote => {}
        _ = from_remote => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reports_open_state_before_cancel() {
        let session = PortForwardSession {
            id: Uuid::new_v4(),
            pod: "p".into(),
            namespace: "ns".into(),
            remote_port: 80,
            local_port: AtomicU16::new(12345),
            bytes_in: AtomicU64::new(10),
            bytes_out: AtomicU64::new(20),
            started_at: Utc::now(),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        let s = session.summary();
        assert_eq!(s.state, SessionState::Open);
        assert_eq!(s.bytes_in, 10);
        assert_eq!(s.bytes_out, 20);
    }

    #[test]
    fn cancelling_moves_to_closed() {
        let session = PortForwardSession {
            id: Uuid::new_v4(),
            pod: "p".into(),
            namespace: "ns".into(),
            remote_port: 80,
            local_port: AtomicU16::new(1),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            started_at: Utc::now(),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        session.cancel.cancel();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn registry_get_missing_is_not_found() {
        let registry = PortForwardRegistry::new();
        assert!(registry.get(Uuid::new_v4()).is_err());
    }
}
