use crate::services::upload_service::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for handler errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 403 Forbidden, used when the auth predicate rejects.
    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "not authorized")
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
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Map service errors onto the HTTP taxonomy: blank identifiers are the
/// client's fault, unknown uploads/parts are 404, a taken upload code is a
/// conflict, and everything touching the filesystem or SQLite is a 500.
impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::EmptyIdentifier => StatusCode::BAD_REQUEST,
            UploadError::UploadNotFound(_) | UploadError::PartNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            UploadError::UploadAlreadyExists(_) => StatusCode::CONFLICT,
            UploadError::Sqlx(_) | UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}
