//! HTTP error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::provider::ProviderError;
use crate::request::RequestError;
use crate::session::TerminalError;

/// Failures returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body or query is invalid.
    #[error("{0}")]
    BadRequest(String),
    /// Provider credentials could not be resolved.
    #[error("{0}")]
    Unauthorized(String),
    /// The resource does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// The resource is not in a state that allows the operation.
    #[error("{0}")]
    Conflict(String),
    /// The resource existed but is gone for good.
    #[error("{0}")]
    Gone(String),
    /// A provider API call failed.
    #[error("{0}")]
    Upstream(String),
    /// Local failure on the backend host.
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    const fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Self::Gone(_) => (StatusCode::GONE, "gone"),
            Self::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = self.status();
        if status.is_server_error() {
            tracing::warn!(%status, error = %self, "request failed");
        }
        let body = ErrorBody {
            error,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth { .. } => Self::Unauthorized(err.to_string()),
            ProviderError::Validation(_) => Self::BadRequest(err.to_string()),
            _ => Self::Upstream(err.to_string()),
        }
    }
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<TerminalError> for ApiError {
    fn from(err: TerminalError) -> Self {
        match err {
            TerminalError::NotReady => Self::Conflict(err.to_string()),
            TerminalError::Closed => Self::Gone(err.to_string()),
            TerminalError::Spawn(_) => Self::Internal(err.to_string()),
        }
    }
}
