use crate::services::storage_service::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures surfaced by the thumbnail cache and the object-store client to the
/// gallery router. The router decides how each one is rendered.
#[derive(Debug, Error)]
pub enum GalleryError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("cannot decode image: {0}")]
    Decode(String),
    #[error("cannot issue access grant: {0}")]
    GrantIssuance(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("object store failure: {0}")]
    Store(String),
}

pub type GalleryResult<T> = Result<T, GalleryError>;

impl GalleryError {
    /// Default HTTP status for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            GalleryError::NotFound(_) => StatusCode::NOT_FOUND,
            GalleryError::Decode(_) | GalleryError::Validation(_) => StatusCode::BAD_REQUEST,
            GalleryError::GrantIssuance(_) | GalleryError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StorageError> for GalleryError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound { key, .. } => GalleryError::NotFound(key),
            StorageError::InvalidObjectKey => GalleryError::Validation(err.to_string()),
            StorageError::Signing(msg) => GalleryError::GrantIssuance(msg),
            other => GalleryError::Store(other.to_string()),
        }
    }
}

/// A lightweight wrapper for errors rendered straight to an HTTP response.
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

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 403 Forbidden, used for rejected grants.
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
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
        let body = Json(json!({ "message": self.message }));
        let mut response = (self.status, body).into_response();
        response.headers_mut().insert(
            axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
            axum::http::HeaderValue::from_static("*"),
        );
        response
    }
}

/// Storage failures reaching an HTTP handler keep their detail in the log only.
impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound { .. } => AppError::not_found("File not found"),
            StorageError::InvalidObjectKey => {
                AppError::new(StatusCode::BAD_REQUEST, "Invalid object key")
            }
            StorageError::GrantRejected(reason) => AppError::forbidden(reason),
            other => {
                tracing::error!(error = %other, "storage failure");
                AppError::internal("Internal server error")
            }
        }
    }
}
