//! # Error Handling and Classification
//!
//! All fallible operations of the proxy core return [`ProxyResult`]. Errors
//! coming back from the upstream registry are sorted into a small taxonomy by
//! [`ProxyError::kind`]:
//!
//! - **NotFound**: upstream says the artifact or tag does not exist
//! - **RateLimit**: upstream is throttling us; the controller falls back to
//!   cached content when it has some
//! - **Generic**: everything else, propagated as-is
//!
//! The HTTP layer in front of the proxy maps errors to statuses with
//! [`ProxyError::http_status`] or simply returns the error, which implements
//! [`IntoResponse`]:
//!
//! ```json
//! {
//!   "error": "too many requests: library/alpine:latest",
//!   "code": "rate_limited",
//!   "timestamp": "2024-01-01T12:00:00Z"
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;

/// Classification of an upstream failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    RateLimit,
    Generic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimit => "rate_limited",
            ErrorKind::Generic => "generic",
        }
    }
}

/// Error response body returned to registry clients
#[derive(Serialize, Debug)]
pub struct ApiErrorResponse {
    pub error: String,
    pub code: String,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    NotFound(String),

    #[error("too many requests: {0}")]
    RateLimit(String),

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    /// A long-running transfer was asked to abort; not a failure
    #[error("operation stopped")]
    Stopped,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ProxyError {
    /// Classify this error.
    ///
    /// An `anyhow` error is classified by the first `ProxyError` found in its
    /// cause chain.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::NotFound(_) => ErrorKind::NotFound,
            ProxyError::RateLimit(_) => ErrorKind::RateLimit,
            ProxyError::Anyhow(e) => e
                .chain()
                .find_map(|cause| cause.downcast_ref::<ProxyError>())
                .map_or(ErrorKind::Generic, ProxyError::kind),
            _ => ErrorKind::Generic,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ErrorKind::RateLimit
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ProxyError::Stopped)
    }

    /// Build an error from a non-success upstream HTTP status
    pub fn from_upstream_status(status: u16, context: &str) -> Self {
        match classify_status(status) {
            ErrorKind::NotFound => ProxyError::NotFound(format!("{context} not found upstream")),
            ErrorKind::RateLimit => ProxyError::RateLimit(context.to_string()),
            ErrorKind::Generic => {
                ProxyError::Upstream(format!("{context}: upstream answered {status}"))
            }
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidArtifact(_) => StatusCode::BAD_REQUEST,
            ProxyError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            _ => match self.kind() {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
                ErrorKind::Generic => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn to_error_response(&self) -> ApiErrorResponse {
        let code = match self {
            ProxyError::InvalidArtifact(_) => "invalid_artifact",
            ProxyError::Stopped => "stopped",
            _ => self.kind().as_str(),
        };
        ApiErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Classify an upstream HTTP status code
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        404 => ErrorKind::NotFound,
        429 => ErrorKind::RateLimit,
        _ => ErrorKind::Generic,
    }
}

/// Classify an error returned through the remote registry port
pub fn classify(err: &ProxyError) -> ErrorKind {
    err.kind()
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request failed");
        }

        (status, axum::Json(self.to_error_response())).into_response()
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
