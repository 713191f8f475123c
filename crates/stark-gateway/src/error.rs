//! API error types and responses.
//!
//! Every handler failure renders as `{"error": {"code", "message"}}` with
//! the status implied by the core error taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use stark_auth::AuthError;
use stark_control::ControlError;
use stark_core::CoreError;

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid authentication token.
    #[error("unauthorized")]
    Unauthorized,

    /// The caller may not perform this action.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid request body or parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The cluster cannot satisfy the request right now.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A downstream agent was unreachable.
    #[error("agent unavailable")]
    AgentUnavailable,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

/// Error details.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// The HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::AgentUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::BadRequest(_) => "bad_request",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::AgentUnavailable => "agent_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Auth(_) => Self::Unauthorized,
            CoreError::PolicyDenied { .. } => Self::Forbidden(err.to_string()),
            CoreError::NotFound(what) => Self::NotFound(what),
            CoreError::Conflict(what) => Self::Conflict(what),
            CoreError::ResourceExhausted(what) => Self::ResourceExhausted(what),
            CoreError::TransportClosed | CoreError::Timeout { .. } => Self::AgentUnavailable,
            CoreError::Invalid(what) => Self::BadRequest(what),
            CoreError::Cancelled => Self::Internal("operation cancelled".to_string()),
            CoreError::Internal(what) => {
                tracing::error!(error = %what, "Internal error");
                Self::Internal(what)
            }
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let core: CoreError = err.into();
        Self::from(core)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Internal(msg) => {
                tracing::error!(error = %msg, "Auth internal error");
                Self::Internal("authentication service error".to_string())
            }
            _ => Self::Unauthorized,
        }
    }
}
