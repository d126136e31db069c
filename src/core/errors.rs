// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum ClusterMuxError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: verb={verb} resource={resource}{}", namespace.as_deref().map(|n| format!(" namespace={n}")).unwrap_or_default())]
    PermissionDenied {
        resource: String,
        verb: String,
        namespace: Option<String>,
        message: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("kubernetes client error: {0}")]
    Kube(Arc<kube::Error>),
}

// Manual Clone because `std::io::Error`/`kube::Error` aren't Clone; wrap in Arc
// for cheap sharing across fan-out (e.g. broadcasting a permission-error to
// every subscriber of a DEGRADED informer).
impl Clone for ClusterMuxError {
    fn clone(&self) -> Self {
        match self {
            Self::NotFound(s) => Self::NotFound(s.clone()),
            Self::PermissionDenied {
                resource,
                verb,
                namespace,
                message,
            } => Self::PermissionDenied {
                resource: resource.clone(),
                verb: verb.clone(),
                namespace: namespace.clone(),
                message: message.clone(),
            },
            Self::Conflict(s) => Self::Conflict(s.clone()),
            Self::Invalid(s) => Self::Invalid(s.clone()),
            Self::Timeout(s) => Self::Timeout(s.clone()),
            Self::Unavailable(s) => Self::Unavailable(s.clone()),
            Self::Internal(s) => Self::Internal(s.clone()),
            Self::Io(e) => Self::Io(Arc::clone(e)),
            Self::Kube(e) => Self::Kube(Arc::clone(e)),
        }
    }
}

impl PartialEq for ClusterMuxError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NotFound(a), Self::NotFound(b)) => a == b,
            (
                Self::PermissionDenied {
                    resource: r1,
                    verb: v1,
                    namespace: n1,
                    ..
                },
                Self::PermissionDenied {
                    resource: r2,
                    verb: v2,
                    namespace: n2,
                    ..
                },
            ) => r1 == r2 && v1 == v2 && n1 == n2,
            (Self::Conflict(a), Self::Conflict(b)) => a == b,
            (Self::Invalid(a), Self::Invalid(b)) => a == b,
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::Unavailable(a), Self::Unavailable(b)) => a == b,
            (Self::Internal(a), Self::Internal(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.to_string() == b.to_string(),
            (Self::Kube(a), Self::Kube(b)) => a.to_string() == b.to_string(),
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl ClusterMuxError {
    /// Short machine-readable tag, used as the SSE error-frame `kind` field
    /// and for metrics labeling.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Conflict(_) => "conflict",
            Self::Invalid(_) => "invalid",
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
            Self::Io(_) => "internal",
            Self::Kube(_) => "unavailable",
        }
    }

    /// Whether the informer reflector should retry this error with backoff,
    /// as opposed to entering the long-cadence DEGRADED re-check (§7).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_) | Self::Kube(_))
    }
}

impl From<std::io::Error> for ClusterMuxError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for ClusterMuxError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(format!("JSON error: {e}"))
    }
}

impl From<serde_yaml::Error> for ClusterMuxError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Invalid(format!("YAML error: {e}"))
    }
}

impl From<url::ParseError> for ClusterMuxError {
    fn from(e: url::ParseError) -> Self {
        Self::Invalid(format!("invalid URL: {e}"))
    }
}

/// Classifies an upstream `kube::Error` into our taxonomy, mirroring the
/// real client's status-code-driven dispatch (see spec §7).
impl From<kube::Error> for ClusterMuxError {
    fn from(e: kube::Error) -> Self {
        if let kube::Error::Api(resp) = &e {
            return match resp.code {
                401 | 403 => Self::PermissionDenied {
                    resource: String::new(),
                    verb: String::new(),
                    namespace: None,
                    message: resp.message.clone(),
                },
                404 => Self::NotFound(resp.message.clone()),
                409 => Self::Conflict(resp.message.clone()),
                422 => Self::Invalid(resp.message.clone()),
                408 | 504 => Self::Timeout(resp.message.clone()),
                _ => Self::Unavailable(resp.message.clone()),
            };
        }
        Self::Kube(Arc::new(e))
    }
}

/// Classifies a `watcher::Error`, unwrapping to the same status-code
/// dispatch as `From<kube::Error>` so a 401/403 behind a list-or-watch
/// failure still surfaces as `PermissionDenied` instead of a generic
/// `Unavailable` that would be retried with backoff (spec §7).
impl From<kube::runtime::watcher::Error> for ClusterMuxError {
    fn from(e: kube::runtime::watcher::Error) -> Self {
        use kube::runtime::watcher::Error as WatcherError;
        match e {
            WatcherError::InitialListFailed(e) | WatcherError::WatchFailed(e) | WatcherError::WatchStartFailed(e) => {
                Self::from(e)
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterMuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_preserves_variant() {
        let e = ClusterMuxError::NotFound("pods/foo".into());
        let c = e.clone();
        assert_eq!(e, c);
    }

    #[test]
    fn permission_denied_kind() {
        let e = ClusterMuxError::PermissionDenied {
            resource: "secrets".into(),
            verb: "list".into(),
            namespace: Some("default".into()),
            message: "forbidden".into(),
        };
        assert_eq!(e.kind(), "permission_denied");
        assert!(!e.is_retryable());
    }

    #[test]
    fn unavailable_is_retryable() {
        assert!(ClusterMuxError::Unavailable("connection reset".into()).is_retryable());
    }
}
