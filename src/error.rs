use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::dao::storage::StorageError;

/// Failures of room operations, carrying the text shown to the user.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The document store rejected or could not complete the operation.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// The action requires a signed-in user or the caller lacks the right.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Malformed input such as a blank message or an unparsable link.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Not possible in the current session, e.g. chatting outside a room.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Requested document or pick was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            // Rules-based stores report missing rights as a storage failure.
            StorageError::PermissionDenied(message) => ServiceError::Unauthorized(message),
            other => ServiceError::Unavailable(other),
        }
    }
}

/// Errors of the HTTP bridge, rendered as `{ "error": code, "message": text }`.
#[derive(Debug, Error)]
pub enum AppError {
    /// Request body failed validation or was otherwise malformed.
    #[error("{0}")]
    BadRequest(String),
    /// Sign-in or ownership required.
    #[error("{0}")]
    Unauthorized(String),
    /// Nothing to return.
    #[error("{0}")]
    NotFound(String),
    /// The session is not in a state that allows the request.
    #[error("{0}")]
    Conflict(String),
    /// The document store could not be reached.
    #[error("{0}")]
    ServiceUnavailable(String),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::ServiceUnavailable(_) => "storage_unavailable",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::BadRequest(format!("validation failed: {err}"))
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(source) => AppError::ServiceUnavailable(source.to_string()),
            ServiceError::Unauthorized(message) => AppError::Unauthorized(message),
            ServiceError::InvalidInput(message) => AppError::BadRequest(message),
            ServiceError::InvalidState(message) => AppError::Conflict(message),
            ServiceError::NotFound(message) => AppError::NotFound(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let payload = Json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        });
        (status, payload).into_response()
    }
}
