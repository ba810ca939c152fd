//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::{DomainError, ErrorCategory};
use crate::store::StoreError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing required header: {0}")]
    MissingHeader(String),

    // Domain errors
    #[error(transparent)]
    Domain(#[from] DomainError),

    // Server errors (5xx)
    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(domain) => AppError::Domain(domain),
            other => AppError::Store(other),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Store(StoreError::Serialization(err))
    }
}

impl AppError {
    /// Transient infrastructure failure
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Store(err) if err.is_retryable())
    }

    /// Stable code stored on failed documents and returned to clients
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::MissingHeader(_) => "missing_header",
            AppError::Domain(err) => err.error_code(),
            AppError::Store(StoreError::Unavailable(_)) => "store_unavailable",
            AppError::Store(StoreError::Serialization(_)) => "serialization_error",
            AppError::Store(StoreError::Corrupt(_)) => "corrupt_record",
            AppError::Store(_) => "database_error",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, details) = match &self {
            // 400 Bad Request
            AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, Some(msg.clone())),
            AppError::MissingHeader(header) => (StatusCode::BAD_REQUEST, Some(header.clone())),

            // Domain errors - map by category
            AppError::Domain(domain_err) => {
                let status = match domain_err.category() {
                    ErrorCategory::Configuration => StatusCode::UNPROCESSABLE_ENTITY,
                    ErrorCategory::Conflict => StatusCode::CONFLICT,
                    ErrorCategory::NotFound => StatusCode::NOT_FOUND,
                    ErrorCategory::Validation => match domain_err {
                        DomainError::InvalidAmount(_)
                        | DomainError::InvalidJournalLine(_)
                        | DomainError::CodeOutOfBand { .. } => StatusCode::BAD_REQUEST,
                        _ => StatusCode::UNPROCESSABLE_ENTITY,
                    },
                };
                (status, None)
            }

            // 503 / 500
            AppError::Store(StoreError::Unavailable(msg)) => {
                tracing::error!("Store unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, None)
            }
            AppError::Store(e) => {
                tracing::error!("Store error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        // Internal details never leave the process
        let error = if status.is_server_error() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            error,
            error_code: self.error_code().to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}
