//! Error types for Tandem services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling
//!
//! Quota exhaustion of the language-model provider is deliberately its own
//! variant: callers must be able to tell "rate limited upstream" apart from
//! every other failure, so it is never folded into a generic error.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MissingField,

    // Resource errors (4xxx)
    NotFound,
    DocumentNotFound,

    // Quota (6xxx)
    QuotaExceeded,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,
    SqlSyntaxError,
    SqlExecutionError,

    // External service errors (8xxx)
    ModelError,
    ModelTimeout,
    EmbeddingError,
    UpstreamError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,
            ErrorCode::DocumentNotFound => 4002,

            // Quota (6xxx)
            ErrorCode::QuotaExceeded => 6001,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,
            ErrorCode::SqlSyntaxError => 7003,
            ErrorCode::SqlExecutionError => 7004,

            // External (8xxx)
            ErrorCode::ModelError => 8001,
            ErrorCode::ModelTimeout => 8002,
            ErrorCode::EmbeddingError => 8003,
            ErrorCode::UpstreamError => 8004,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Required field missing: {field}")]
    MissingField { field: String },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    // Language-model quota. Carries the provider's message verbatim so the
    // caller can surface it unchanged.
    #[error("Language model quota exceeded: {message}")]
    QuotaExceeded { message: String },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("SQL syntax rejected by the database: {message}")]
    SqlSyntax { message: String },

    #[error("SQL execution failed: {message}")]
    SqlExecution { message: String },

    // External service errors
    #[error("Language model error: {message}")]
    ModelError { message: String },

    #[error("Language model timeout after {timeout_ms}ms")]
    ModelTimeout { timeout_ms: u64 },

    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MissingField { .. } => ErrorCode::MissingField,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::DocumentNotFound { .. } => ErrorCode::DocumentNotFound,
            AppError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::SqlSyntax { .. } => ErrorCode::SqlSyntaxError,
            AppError::SqlExecution { .. } => ErrorCode::SqlExecutionError,
            AppError::ModelError { .. } => ErrorCode::ModelError,
            AppError::ModelTimeout { .. } => ErrorCode::ModelTimeout,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. } | AppError::MissingField { .. } => StatusCode::BAD_REQUEST,

            // 404 Not Found
            AppError::NotFound { .. } | AppError::DocumentNotFound { .. } => StatusCode::NOT_FOUND,

            // 429 Too Many Requests
            AppError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::SqlSyntax { .. }
            | AppError::SqlExecution { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::ModelError { .. }
            | AppError::ModelTimeout { .. }
            | AppError::EmbeddingError { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// True exactly for the quota variant. Pipelines use this to decide
    /// whether an upstream failure must abort the whole question.
    pub fn is_quota(&self) -> bool {
        matches!(self, AppError::QuotaExceeded { .. })
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details: None,
                request_id: None, // Should be filled by middleware
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}
