// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use okean_common::ServerMessage;
use thiserror::Error;

use crate::validation::ValidationError;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Call not found")]
    CallNotFound,

    #[error("Caller already has an active call")]
    CallConflict,

    #[error("Target user is busy")]
    TargetBusy,

    #[error("Target user has no live connections")]
    TargetUnreachable,

    #[error("Cannot {action} a call that is {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) | AppError::CallNotFound => StatusCode::NOT_FOUND,
            AppError::CallConflict | AppError::TargetBusy | AppError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            },
            AppError::TargetUnreachable => StatusCode::NOT_FOUND,
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::Io(_) | AppError::Json(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Unauthorized(_) => "AUTH_001",
            AppError::NotFound(_) => "NF_001",
            AppError::CallNotFound => "CALL_001",
            AppError::CallConflict => "CALL_002",
            AppError::TargetBusy => "CALL_003",
            AppError::TargetUnreachable => "CALL_004",
            AppError::InvalidTransition { .. } => "CALL_005",
            AppError::InvalidArgument(_) => "VAL_001",
            AppError::RateLimitExceeded => "RATE_001",
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "JSON_001",
            AppError::Internal(_) => "INT_001",
        }
    }

    /// Get a sanitized message suitable for showing to end users
    pub fn reason(&self) -> String {
        match self {
            AppError::Unauthorized(_) => "Unauthorized".to_string(),
            AppError::NotFound(what) => format!("Not found: {what}"),
            AppError::CallNotFound => "Call not found".to_string(),
            AppError::CallConflict => "You are already in a call".to_string(),
            AppError::TargetBusy => "User is busy".to_string(),
            AppError::TargetUnreachable => "User is not available".to_string(),
            AppError::InvalidTransition { .. } => self.to_string(),
            AppError::InvalidArgument(msg) => msg.clone(),
            AppError::RateLimitExceeded => {
                "Rate limit exceeded, please slow down".to_string()
            },
            AppError::Io(_) | AppError::Json(_) | AppError::Internal(_) => {
                "An internal server error occurred".to_string()
            },
        }
    }

    /// Convert into the event reported back to the invoking connection.
    /// Call commands get `CallError` so the client can reset its call UI.
    pub fn into_client_event(self, call_command: bool) -> ServerMessage {
        if call_command {
            ServerMessage::CallError {
                code: self.error_code().to_string(),
                reason: self.reason(),
            }
        } else {
            ServerMessage::Error {
                code: self.error_code().to_string(),
                message: self.reason(),
            }
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::InvalidArgument(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Use detailed messages in development, sanitized in production
        let message = if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.reason()
        };

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
