// src/http/error.rs

//! Maps `ClusterMuxError` onto HTTP status codes (spec §7's taxonomy).

use crate::core::errors::ClusterMuxError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

impl IntoResponse for ClusterMuxError {
    fn into_response(self) -> Response {
        let status = match &self {
            ClusterMuxError::NotFound(_) => StatusCode::NOT_FOUND,
            ClusterMuxError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            ClusterMuxError::Conflict(_) => StatusCode::CONFLICT,
            ClusterMuxError::Invalid(_) => StatusCode::BAD_REQUEST,
            ClusterMuxError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ClusterMuxError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ClusterMuxError::Internal(_) | ClusterMuxError::Io(_) | ClusterMuxError::Kube(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({ "kind": self.kind(), "message": self.to_string() }));
        (status, body).into_response()
    }
}
