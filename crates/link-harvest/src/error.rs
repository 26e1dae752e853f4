//! Error types for the harvesting pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    /// Submission rejected before a job was created
    #[error("Validation error: {0}")]
    Validation(String),

    /// Status query for an unknown job
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Operation not allowed in the job's current state
    #[error("Invalid job state: {0}")]
    InvalidState(String),

    /// Chunk execution failed as a whole
    #[error("Processing error: {0}")]
    Processing(String),

    /// Job was cancelled between chunks
    #[error("cancelled")]
    Cancelled,

    /// Job status or artifact storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV serialization error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a processing error
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether a job attempt that failed with this error may be retried.
    ///
    /// Only processing-level failures qualify. Validation problems and
    /// cancellation are permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Processing(_) | Error::Storage(_) | Error::Io(_) | Error::Csv(_) | Error::Internal(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.clone()),
            Error::JobNotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Job {} not found", id),
            ),
            Error::InvalidState(msg) => (StatusCode::CONFLICT, "invalid_state", msg.clone()),
            Error::Processing(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "processing_error", msg.clone())
            }
            Error::Cancelled => (StatusCode::CONFLICT, "cancelled", self.to_string()),
            Error::Storage(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg.clone())
            }
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            Error::Io(err) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error", err.to_string()),
            Error::Csv(err) => (StatusCode::BAD_REQUEST, "csv_error", err.to_string()),
            Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
