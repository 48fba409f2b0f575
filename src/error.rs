//! Unified error handling
//!
//! `PipelineError` is the taxonomy the import/optimization pipeline works in;
//! `ApiError` turns it (and everything else) into consistent HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Failure category reported for AI collaborator calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorErrorKind {
    Timeout,
    BadResponse,
    RateLimited,
    Unknown,
}

impl std::fmt::Display for CollaboratorErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollaboratorErrorKind::Timeout => write!(f, "timeout"),
            CollaboratorErrorKind::BadResponse => write!(f, "bad_response"),
            CollaboratorErrorKind::RateLimited => write!(f, "rate_limited"),
            CollaboratorErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// An AI call that failed, timed out or returned something unusable.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("AI collaborator {kind}: {message}")]
pub struct CollaboratorError {
    pub kind: CollaboratorErrorKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(kind: CollaboratorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            CollaboratorErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    pub fn bad_response(message: impl Into<String>) -> Self {
        Self::new(CollaboratorErrorKind::BadResponse, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(CollaboratorErrorKind::RateLimited, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(CollaboratorErrorKind::Unknown, message)
    }
}

/// Persistence failures. Fatal to the operation that hit them.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Cache error: {0}")]
    Cache(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// A conditional update lost its race. Callers usually report this as skipped.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Storage(StorageError::Database(e))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

// ============================================================================
// API Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Storage error")]
    Storage(#[from] StorageError),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::NotFound(msg)
            | Self::BadRequest(msg)
            | Self::Conflict(msg)
            | Self::Upstream(msg) => msg.clone(),
            // Don't leak internal error details
            Self::Storage(_) => "An internal error occurred".to_string(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(msg) => Self::BadRequest(msg),
            PipelineError::Collaborator(err) => Self::Upstream(err.to_string()),
            PipelineError::Conflict(msg) => Self::Conflict(msg),
            PipelineError::Storage(err) => Self::Storage(err),
            PipelineError::NotFound(msg) => Self::NotFound(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Storage(e) => {
                tracing::error!(error = %e, "Storage error");
            }
            _ => {
                tracing::warn!(error = %self, "API error");
            }
        }

        let status = self.status_code();
        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.public_message(),
            request_id: None,
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
