//! Error taxonomy for the self-hosted adapter
//!
//! Every failure that crosses the adapter boundary is an [`AdapterError`].
//! Each variant carries a machine-stable kind (see [`AdapterError::kind`]) and a
//! human-readable message. Transport-level failures stay internal as
//! [`TransportError`] until the executor decides whether to fall back or surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::redact::redact_secrets;

pub type Result<T> = std::result::Result<T, AdapterError>;

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Missing or rejected bearer credential
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed request (missing name, empty files, bad file paths)
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// A concurrent writer changed the entity first
    #[error("conflict: {0}")]
    Conflict(String),

    /// Every configured transport or remote service failed
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Feature has no self-hosted equivalent
    #[error("unsupported in self-hosted mode: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Unauthorized(_) => "unauthorized",
            AdapterError::Validation(_) => "validation_error",
            AdapterError::NotFound(_) => "not_found",
            AdapterError::Conflict(_) => "conflict",
            AdapterError::Upstream(_) => "upstream_error",
            AdapterError::Unsupported(_) => "unsupported_operation",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AdapterError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AdapterError::Validation(_) => StatusCode::BAD_REQUEST,
            AdapterError::NotFound(_) => StatusCode::NOT_FOUND,
            AdapterError::Conflict(_) => StatusCode::CONFLICT,
            AdapterError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AdapterError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        AdapterError::Upstream(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        AdapterError::Unsupported(msg.into())
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        // Drop the URL: query strings may carry filter values we don't want echoed.
        AdapterError::Upstream(e.without_url().to_string())
    }
}

impl From<rusqlite::Error> for AdapterError {
    fn from(e: rusqlite::Error) -> Self {
        AdapterError::Upstream(format!("sqlite: {}", e))
    }
}

/// Failure of a single transport attempt
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection unavailable: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("remote procedure returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// JSON body for error responses on the management API
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: redact_secrets(&self.to_string()),
        };
        (self.status(), Json(body)).into_response()
    }
}
