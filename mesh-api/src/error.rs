// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });
        (status, body).into_response()
    }
}

/// Map the mesh error taxonomy onto HTTP statuses.
impl From<mesh_core::Error> for AppError {
    fn from(err: mesh_core::Error) -> Self {
        use mesh_core::Error;

        match err {
            Error::InvalidInput(msg) => Self::bad_request(msg),
            Error::InvalidTransition { from, to } => {
                Self::bad_request(format!("invalid status transition: {from} -> {to}"))
            }
            Error::NotFound(msg) => Self::not_found(msg),
            Error::DuplicateInstance(id) => {
                Self::conflict(format!("instance '{id}' already registered"))
            }
            Error::NoCandidates(service) => {
                Self::not_found(format!("no candidates for service '{service}'"))
            }
            Error::NoResolution(name) => Self::not_found(format!("no resolution for '{name}'")),
            Error::CircuitOpen {
                service,
                instance_id,
            } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("circuit open for {service}/{instance_id}"),
            ),
            Error::Timeout(msg) => Self::new(StatusCode::GATEWAY_TIMEOUT, msg),
            Error::Cancelled(msg) => Self::new(StatusCode::REQUEST_TIMEOUT, msg),
            Error::PeerUnreachable(msg) => Self::new(StatusCode::BAD_GATEWAY, msg),
            Error::StateCorruption(msg) => {
                tracing::error!("State corruption surfaced over HTTP: {msg}");
                Self::internal("state corrupted")
            }
            Error::Configuration(msg) => {
                tracing::error!("Configuration error: {msg}");
                Self::internal("configuration error")
            }
            Error::Serialization(e) => {
                tracing::error!("Serialization error: {e}");
                Self::internal("serialization error")
            }
            Error::Io(e) => {
                tracing::error!("IO error: {e}");
                Self::internal("io error")
            }
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("invalid request body: {err}"))
    }
}
