//! Handler errors and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use neomind_extension_host::ExtensionError;

use super::common::ApiResponse;

/// Error returned by handlers; rendered as an [`ApiResponse`] failure.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{} not found", what.into()),
        )
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<ExtensionError> for ErrorResponse {
    fn from(err: ExtensionError) -> Self {
        let status = match &err {
            ExtensionError::NotFound(_) | ExtensionError::CommandNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ExtensionError::InvalidArguments(_) | ExtensionError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            ExtensionError::AlreadyRegistered(_) => StatusCode::CONFLICT,
            ExtensionError::CircuitOpen(_) | ExtensionError::ResourceExceeded(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ExtensionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let details = match &err {
            ExtensionError::CommandNotFound {
                extension_id,
                command,
                available,
            } => Some(json!({
                "extension_id": extension_id,
                "command": command,
                "available": available,
            })),
            ExtensionError::BufferTooSmall { needed, capacity } => Some(json!({
                "needed": needed,
                "capacity": capacity,
            })),
            ExtensionError::Timeout(ms) => Some(json!({ "timeout_ms": ms })),
            _ => None,
        };

        Self {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, code = %self.code, message = %self.message, "Request failed");
        }
        let status = self.status;
        (status, Json(ApiResponse::<()>::from_error_response(self))).into_response()
    }
}
