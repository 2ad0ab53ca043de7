//! HTTP error mapping. Every error body is plain text.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::error::{Error, TaskError};

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Compile(e) => Self::BadRequest(e.to_string()),
            Error::Delay(e) => Self::BadRequest(e.to_string()),
            Error::Task(e @ (TaskError::NotFound { .. } | TaskError::SubtaskNotFound { .. })) => {
                Self::NotFound(e.to_string())
            }
            Error::Task(e) => Self::BadRequest(e.to_string()),
            other => {
                error!(error = %other, "Request failed");
                Self::Internal(other.to_string())
            }
        }
    }
}

/// Malformed, mistyped or non-JSON bodies are all plain bad requests.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}
