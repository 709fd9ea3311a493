use crate::services::{backend::BackendError, engine::ServiceError, traversal::TraversalError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Stable reject-reason code, when the error came from a rejected submission.
    pub reason: Option<&'static str>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            reason: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "reason": self.reason,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::InvalidRequest(_)
            | ServiceError::IsLink(_)
            | ServiceError::InvalidArchiveLayout { .. }
            | ServiceError::NoDataObjects(_)
            | ServiceError::Traversal(TraversalError::DepthExceeded { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::NotFound(_) | ServiceError::Traversal(TraversalError::RootNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::FileNotArchived(_) => StatusCode::CONFLICT,
            ServiceError::NotSupported(_)
            | ServiceError::Backend(BackendError::OperationNotSupported(_)) => {
                StatusCode::NOT_IMPLEMENTED
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            status,
            message: err.to_string(),
            reason: Some(err.reason()),
        }
    }
}
