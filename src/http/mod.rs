// src/http/mod.rs

//! Thin external-collaborator layer (spec §6): axum router wiring over the
//! core components. No business logic lives here — every handler resolves
//! query/path parameters, calls into `core::`, and maps the result onto the
//! wire.

mod cloudshell;
mod credentials;
mod error;
mod exec;
mod logs;
mod permissions;
mod portforward;
mod resource;
mod traces;

use crate::core::state::ServerState;
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/credentials", get(credentials::list_credentials).post(credentials::add_credential))
        .route(
            "/credentials/:id",
            get(credentials::get_credential).delete(credentials::delete_credential),
        )
        .route("/permissions/check", get(permissions::check))
        .route("/apply", post(resource::apply))
        .route("/traces", get(traces::query))
        .route("/traces/service-map", get(traces::service_map))
        .route("/traces/export", get(traces::export))
        .route("/portforward/ws", get(portforward::open_ws))
        .route("/portforward/sessions", get(portforward::list_sessions))
        .route("/portforward/sessions/:id", delete(portforward::delete_session))
        .route("/cloudshell", post(cloudshell::create).get(cloudshell::list))
        .route("/cloudshell/cleanup", post(cloudshell::cleanup))
        .route("/cloudshell/ws", get(cloudshell::ws))
        .route("/cloudshell/:name", delete(cloudshell::delete))
        .route("/pods/:ns/:name/exec/ws", get(exec::handler))
        .route("/pods/:ns/:name/logs/ws", get(logs::handler))
        .route("/:plural", get(resource::list_stream).delete(resource::bulk_delete))
        .route("/:plural/:namespace/:name", get(resource::detail))
        .route("/:plural/:namespace/:name/yaml", get(resource::detail_yaml))
        .route("/:plural/:namespace/:name/events", get(resource::object_events))
        .with_state(state);

    Router::new().nest("/api/v1", api).layer(TraceLayer::new_for_http())
}
