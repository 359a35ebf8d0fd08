use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application error types
#[derive(Debug)]
pub enum ApmError {
    /// Configuration error
    ConfigError(String),
    /// Operator authentication error
    Unauthorized(String),
    /// Storage layer error (propagated, never swallowed)
    Storage(sqlx::Error),
    /// Malformed request to the operator API
    BadRequest(String),
    /// Internal server error
    InternalError(String),
}

impl fmt::Display for ApmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Self::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Self::Storage(err) => write!(f, "Storage error: {}", err),
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ApmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl IntoResponse for ApmError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            Self::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            // Storage details stay out of responses
            Self::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage error".to_string(),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type_name(&self),
            }
        }));

        (status, body).into_response()
    }
}

fn error_type_name(error: &ApmError) -> &'static str {
    match error {
        ApmError::ConfigError(_) => "config_error",
        ApmError::Unauthorized(_) => "unauthorized",
        ApmError::Storage(_) => "storage_error",
        ApmError::BadRequest(_) => "bad_request",
        ApmError::InternalError(_) => "internal_error",
    }
}

// Implement conversions from common error types
impl From<sqlx::Error> for ApmError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err)
    }
}

impl From<anyhow::Error> for ApmError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for ApmError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}
