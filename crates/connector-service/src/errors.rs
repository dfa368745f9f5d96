//! Connector service error types.
//!
//! Every error maps 1:1 onto a stable machine-readable code so operators can
//! tell lock contention and a tripped breaker apart from generic failures.
//! Store failures are logged server-side and reported with a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classification of a failed call to the external meeting-platform API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalErrorKind {
    /// API base URL is not configured.
    NotConfigured,
    /// Request timed out.
    Timeout,
    /// Connection failed or the API answered with a 5xx.
    Unavailable,
    /// 401/403 from the API.
    Auth,
    /// 429 from the API.
    RateLimited,
    /// 400/404/422 from the API.
    BadRequest,
    /// 2xx with a body that is not valid JSON.
    InvalidResponse,
    /// Any other failure reported by the API or the HTTP client.
    Provider,
}

impl ExternalErrorKind {
    /// Label used in logs, metrics and error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalErrorKind::NotConfigured => "not_configured",
            ExternalErrorKind::Timeout => "timeout",
            ExternalErrorKind::Unavailable => "unavailable",
            ExternalErrorKind::Auth => "auth",
            ExternalErrorKind::RateLimited => "rate_limited",
            ExternalErrorKind::BadRequest => "bad_request",
            ExternalErrorKind::InvalidResponse => "invalid_response",
            ExternalErrorKind::Provider => "provider_error",
        }
    }

    /// Kind implied by a non-2xx HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ExternalErrorKind::Auth,
            429 => ExternalErrorKind::RateLimited,
            400 | 404 | 422 => ExternalErrorKind::BadRequest,
            500..=599 => ExternalErrorKind::Unavailable,
            _ => ExternalErrorKind::Provider,
        }
    }
}

impl fmt::Display for ExternalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connector service error type.
///
/// Maps to HTTP status codes:
/// - Busy, InvalidState: 409 Conflict
/// - CircuitOpen: 503 Service Unavailable
/// - ExternalApi: 502 Bad Gateway
/// - NotFound: 404 Not Found
/// - BadRequest: 400 Bad Request
/// - Store, Internal: 500 Internal Server Error
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    #[error("Operation already in progress for meeting {0}")]
    Busy(String),

    #[error("Circuit breaker is open for connector {0}")]
    CircuitOpen(String),

    #[error("External API error ({kind}): {detail}")]
    ExternalApi {
        kind: ExternalErrorKind,
        status: Option<u16>,
        detail: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// Build an external API error.
    pub fn external(kind: ExternalErrorKind, status: Option<u16>, detail: impl Into<String>) -> Self {
        ConnectorError::ExternalApi {
            kind,
            status,
            detail: detail.into(),
        }
    }

    /// Returns the HTTP status code for this error (for metrics recording).
    pub fn status_code(&self) -> u16 {
        match self {
            ConnectorError::Busy(_) | ConnectorError::InvalidState(_) => 409,
            ConnectorError::CircuitOpen(_) => 503,
            ConnectorError::ExternalApi { .. } => 502,
            ConnectorError::NotFound(_) => 404,
            ConnectorError::BadRequest(_) => 400,
            ConnectorError::Store(_) | ConnectorError::Internal(_) => 500,
        }
    }

    /// Stable error code returned to clients and used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectorError::Busy(_) => "BUSY",
            ConnectorError::CircuitOpen(_) => "CIRCUIT_OPEN",
            ConnectorError::ExternalApi { .. } => "EXTERNAL_API_ERROR",
            ConnectorError::NotFound(_) => "NOT_FOUND",
            ConnectorError::InvalidState(_) => "INVALID_STATE",
            ConnectorError::Store(_) => "STORE_ERROR",
            ConnectorError::BadRequest(_) => "BAD_REQUEST",
            ConnectorError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_status: Option<u16>,
}

impl IntoResponse for ConnectorError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = self.code().to_string();

        let (message, kind, external_status) = match &self {
            ConnectorError::Store(err) => {
                tracing::error!(target: "connector.store", error = %err, "Store operation failed");
                ("A session store error occurred".to_string(), None, None)
            }
            ConnectorError::Internal(err) => {
                tracing::error!(target: "connector.internal", error = %err, "Internal error");
                ("An internal error occurred".to_string(), None, None)
            }
            ConnectorError::ExternalApi {
                kind,
                status,
                detail,
            } => (
                format!("External API call failed: {detail}"),
                Some(kind.as_str().to_string()),
                *status,
            ),
            other => (other.to_string(), None, None),
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code,
                message,
                kind,
                external_status,
            },
        };

        (status, Json(error_response)).into_response()
    }
}

impl From<sqlx::Error> for ConnectorError {
    fn from(err: sqlx::Error) -> Self {
        ConnectorError::Store(err.to_string())
    }
}

impl From<redis::RedisError> for ConnectorError {
    fn from(err: redis::RedisError) -> Self {
        ConnectorError::Store(err.to_string())
    }
}
