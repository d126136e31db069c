// src/server/spawner.rs

//! Spawns all of the server's long-running background tasks. The Event
//! Coalescer is already running by the time this is called (spawned inside
//! `ServerState::initialize`); this module spawns the tasks that are
//! optional or configuration-gated.

use super::context::ServerContext;
use super::metrics_server;
use anyhow::Result;
use std::time::Duration;
use tracing::info;

/// Spawns all background tasks into the context's `JoinSet`.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = ctx.state.clone();
    let background_tasks = &mut ctx.background_tasks;

    state.cloudshell.spawn(
        Duration::from_secs(state.config.cloudshell_cleanup_interval_h * 3600),
        state.root_cancel.child_token(),
    );

    if state.config.metrics.enabled {
        let metrics_state = state.clone();
        let cancel = state.root_cancel.child_token();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, cancel).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
