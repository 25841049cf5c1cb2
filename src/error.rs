//! Categorized error kinds for the control plane.
//!
//! Every error surfaced to an API caller is one of these kinds; the HTTP
//! mapping lives here so handlers never hand-roll status codes. Errors with
//! no caller to surface to (workers, sync tasks) are logged and recorded as
//! status on the persisted entity instead.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::DomainError;

/// Uniform error body returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Short machine-readable kind, e.g. `"quota_exceeded"`.
    pub error: String,
    /// Human-readable description safe to show to callers.
    pub message: String,
}

/// Error kinds surfaced by API-facing operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request, missing required fields, bad resource unit.
    #[error("{0}")]
    Validation(String),

    /// Missing or invalid bearer token.
    #[error("{0}")]
    Unauthenticated(String),

    /// Cross-tenant access, heartbeat/session mismatch.
    #[error("{0}")]
    Authorization(String),

    /// User over limit; not retryable without operator action.
    #[error("{0}")]
    Quota(String),

    /// Template/session/repository missing.
    #[error("{0}")]
    NotFound(String),

    /// No online agent matches, or an install is still materializing.
    /// Retryable; the message carries guidance.
    #[error("{0}")]
    Unavailable(String),

    /// State transition rejected (e.g. waking a non-hibernated session).
    #[error("{0}")]
    Conflict(String),

    /// Unexpected store failure; logged with context, surfaced opaquely.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::Quota(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthenticated(_) => "unauthorized",
            Self::Authorization(_) => "forbidden",
            Self::Quota(_) => "quota_exceeded",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(source) = &self {
            // Full context stays in the log; the body never leaks internals.
            tracing::error!(error = ?source, "internal error serving request");
        }
        let body = ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(err.into())
    }
}
