//! Error types for the Shipyard platform

use axum::http::StatusCode;
use thiserror::Error;

/// Main error type for the control plane and the build executor
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Launch error: {0}")]
    LaunchError(String),

    #[error("Build failure: {0}")]
    BuildFailure(String),

    #[error("Publish failure: {0}")]
    PublishFailure(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlatformError {
    /// HTTP status code reported by the admission API for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            PlatformError::ValidationError(_) => StatusCode::BAD_REQUEST,
            PlatformError::NotFound(_) => StatusCode::NOT_FOUND,
            PlatformError::Conflict(_) => StatusCode::CONFLICT,
            PlatformError::LaunchError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only transport failures are retried, and only through redelivery
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlatformError::TransportError(_))
    }
}

impl From<anyhow::Error> for PlatformError {
    fn from(err: anyhow::Error) -> Self {
        PlatformError::Internal(err.to_string())
    }
}
