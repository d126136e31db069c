// src/http/traces.rs

//! `/traces` routes: not named in spec §6's HTTP list (the Trace Ring's
//! [MODULE] block names `query`/`service_map`/`export` as operations without
//! a wire format), supplemented here the same way `http/credentials.rs`
//! supplements the Credential Store's missing surface.

use crate::core::errors::Result;
use crate::core::state::ServerState;
use crate::core::trace::{ExportFormat, SpanStatus, TraceQuery};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct TraceQueryParams {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub service: Option<String>,
    pub operation: Option<String>,
    #[serde(rename = "minDurationMs")]
    pub min_duration_ms: Option<u64>,
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl From<TraceQueryParams> for TraceQuery {
    fn from(p: TraceQueryParams) -> Self {
        TraceQuery {
            since: p.since,
            until: p.until,
            service: p.service,
            operation: p.operation,
            min_duration: p.min_duration_ms.map(Duration::from_millis),
            status: p.status.and_then(|s| match s.to_ascii_lowercase().as_str() {
                "ok" => Some(SpanStatus::Ok),
                "error" => Some(SpanStatus::Error),
                _ => None,
            }),
            limit: p.limit,
        }
    }
}

/// `GET /traces`.
pub async fn query(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<TraceQueryParams>,
) -> Json<crate::core::trace::TracePage> {
    Json(state.traces.query(&params.into()))
}

/// `GET /traces/service-map`.
pub async fn service_map(State(state): State<Arc<ServerState>>) -> Json<crate::core::trace::ServiceMap> {
    Json(state.traces.service_map())
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormatParam,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormatParam {
    #[default]
    Json,
    Otlp,
}

/// `GET /traces/export?format=json|otlp`.
pub async fn export(State(state): State<Arc<ServerState>>, Query(q): Query<ExportQuery>) -> Result<Response> {
    let format = match q.format {
        ExportFormatParam::Json => ExportFormat::Json,
        ExportFormatParam::Otlp => ExportFormat::Otlp,
    };
    let body = state.traces.export(format)?;
    Ok(([(axum::http::header::CONTENT_TYPE, "application/json")], body).into_response())
}
