//! 统一的 API 错误类型与转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io::{self, ErrorKind};
use tracing::error;

use crate::rewrite::UrdfError;
use crate::storage::StorageError;
use crate::viewer::ViewerError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(u64),
    Internal(String),
}

impl ApiError {
    /// I/O failures outside the sandbox check: missing files are the client's problem.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg).into_response(),
            ApiError::PayloadTooLarge(limit) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("body exceeds {limit} bytes"),
            )
                .into_response(),
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(err) => ApiError::from_io(err),
        }
    }
}

impl From<UrdfError> for ApiError {
    fn from(error: UrdfError) -> Self {
        match error {
            UrdfError::Io(err) => ApiError::from_io(err),
            UrdfError::OutsideRoot | UrdfError::Parse(_) => {
                ApiError::BadRequest(error.to_string())
            }
            UrdfError::Serialize(_) => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<ViewerError> for ApiError {
    fn from(error: ViewerError) -> Self {
        match error {
            ViewerError::NotRunning => ApiError::NotFound(error.to_string()),
            ViewerError::Spawn { .. } => ApiError::Internal(error.to_string()),
        }
    }
}
