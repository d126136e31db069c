// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{filter::EnvFilter, reload};

mod context;
mod http_loop;
mod initialization;
mod metrics_server;
mod spawner;
mod stream;

pub use stream::AnyStream;

/// Marks a listener-bind failure distinctly from every other startup error
/// (config parsing, TLS setup, state init), so `main` can map it to its own
/// exit code (spec §6: bind failures exit 2, everything else exits 1).
#[derive(Debug, Error)]
#[error("failed to bind listen address: {0}")]
pub struct BindError(#[source] pub std::io::Error);

/// The main server startup function, orchestrating all setup phases.
pub async fn run(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    // 1. Initialize server state, listener, TLS, router.
    let mut server_context = initialization::setup(config, log_reload_handle).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context).await?;

    // 3. Start the main connection acceptance loop. Runs until shutdown.
    http_loop::run(server_context).await;

    Ok(())
}
