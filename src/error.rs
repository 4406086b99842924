//! Error types for Quantum Storytelling
//!
//! One taxonomy shared by the store, the gateway and the route layer.
//! Route handlers convert into [`ApiError`], which renders the `{error}` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::logging;

#[derive(Error, Debug)]
pub enum Error {
    /// Required input missing or malformed
    #[error("{0}")]
    Validation(String),

    /// The LLM provider call itself failed (network, quota, non-2xx)
    #[error("Generation unavailable: {0}")]
    GenerationUnavailable(String),

    /// The provider answered but the output broke the structured contract
    #[error("Generation parse error: {0}")]
    GenerationParse(String),

    /// Persistence layer failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Referenced story or tensor does not exist
    #[error("{0}")]
    NotFound(String),

    /// Startup configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures that came out of a generation call.
    pub fn is_generation_failure(&self) -> bool {
        matches!(self, Error::GenerationUnavailable(_) | Error::GenerationParse(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::GenerationUnavailable(_) | Error::GenerationParse(_) => StatusCode::BAD_GATEWAY,
            Error::StoreUnavailable(_) | Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::StoreUnavailable(format!("store task failed: {}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::GenerationUnavailable(err.to_string())
    }
}

// ============ Route Boundary ============

/// Error as seen by an HTTP caller: a status and a user-facing message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    /// Map a domain error for a specific task.
    ///
    /// Validation and not-found messages are meant for the caller and pass
    /// through. Everything else is logged and replaced by `fallback`, so no
    /// provider or store detail leaks out.
    pub fn task(err: Error, fallback: &str) -> Self {
        let status = err.status_code();
        let message = match &err {
            Error::Validation(msg) | Error::NotFound(msg) => msg.clone(),
            _ => {
                logging::log_error(None, &format!("{}: {}", fallback, err));
                fallback.to_string()
            }
        };
        Self { status, message }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::task(err, "Request failed")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(Error::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(Error::GenerationParse("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            Error::StoreUnavailable("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_task_error_hides_provider_detail() {
        let err = ApiError::task(
            Error::GenerationUnavailable("quota exceeded for key abc".into()),
            "Failed to generate premise",
        );
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.message, "Failed to generate premise");
    }

    #[test]
    fn test_task_error_keeps_validation_message() {
        let err = ApiError::task(Error::Validation("User ID is required".into()), "ignored");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "User ID is required");
    }

    #[test]
    fn test_generation_failure_classification() {
        assert!(Error::GenerationParse("x".into()).is_generation_failure());
        assert!(Error::GenerationUnavailable("x".into()).is_generation_failure());
        assert!(!Error::StoreUnavailable("x".into()).is_generation_failure());
    }
}
