// src/server/context.rs

use crate::core::state::ServerState;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

/// Holds all the initialized state required to run the server's main loop.
/// Shutdown is cascaded entirely through `state.root_cancel` (spec §5);
/// there is no separate broadcast channel.
pub struct ServerContext {
    pub state: Arc<ServerState>,
    pub router: Router,
    pub listener: TcpListener,
    pub background_tasks: JoinSet<anyhow::Result<()>>,
    pub acceptor: Option<TlsAcceptor>,
}
