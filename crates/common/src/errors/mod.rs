//! Error types for docpilot services
//!
//! Provides a single error taxonomy shared by the ingestion CLI and the
//! gateway:
//! - Distinct error types for each pipeline stage
//! - HTTP status code mapping for the REST surface
//! - Stable client-facing messages (internal detail is logged, never sent)
//! - Machine-readable codes for protocol `error` events

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
    InvalidFormat,
    MessageTooLong,

    // Session errors (2xxx)
    SessionError,

    // Rate limiting (3xxx)
    RateLimited,

    // Retrieval errors (4xxx)
    RetrievalError,
    EmbeddingError,
    EmbeddingTimeout,
    IndexError,

    // Generation errors (5xxx)
    GenerationError,
    GenerationTimeout,

    // Query lifecycle (6xxx)
    Cancelled,
    QueryTimeout,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // Cache errors (8xxx)
    CacheError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,

    // Service unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,
            ErrorCode::InvalidFormat => 1003,
            ErrorCode::MessageTooLong => 1004,

            // Sessions (2xxx)
            ErrorCode::SessionError => 2001,

            // Rate limits (3xxx)
            ErrorCode::RateLimited => 3001,

            // Retrieval (4xxx)
            ErrorCode::RetrievalError => 4001,
            ErrorCode::EmbeddingError => 4002,
            ErrorCode::EmbeddingTimeout => 4003,
            ErrorCode::IndexError => 4004,

            // Generation (5xxx)
            ErrorCode::GenerationError => 5001,
            ErrorCode::GenerationTimeout => 5002,

            // Query lifecycle (6xxx)
            ErrorCode::Cancelled => 6001,
            ErrorCode::QueryTimeout => 6002,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            // Cache (8xxx)
            ErrorCode::CacheError => 8001,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,

            ErrorCode::ServiceUnavailable => 9999,
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

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    #[error("Message too long: {length} chars exceeds limit of {limit}")]
    MessageTooLong { length: usize, limit: usize },

    // Session errors
    #[error("Session error: {message}")]
    Session { message: String },

    // Rate limiting
    #[error("Rate limit exceeded, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    // Retrieval errors
    #[error("Retrieval error: {message}")]
    Retrieval { message: String },

    #[error("Embedding service error: {message}")]
    Embedding { message: String },

    #[error("Embedding timeout after {timeout_ms}ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    #[error("Vector index error: {message}")]
    Index { message: String },

    // Generation errors
    #[error("Generation error: {message}")]
    Generation { message: String },

    #[error("Generation timeout after {timeout_ms}ms")]
    GenerationTimeout { timeout_ms: u64 },

    // Query lifecycle
    #[error("Query cancelled")]
    Cancelled,

    #[error("Query exceeded {timeout_secs}s time budget")]
    QueryTimeout { timeout_secs: u64 },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // Cache errors
    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

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
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::MessageTooLong { .. } => ErrorCode::MessageTooLong,
            AppError::Session { .. } => ErrorCode::SessionError,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Retrieval { .. } => ErrorCode::RetrievalError,
            AppError::Embedding { .. } => ErrorCode::EmbeddingError,
            AppError::EmbeddingTimeout { .. } => ErrorCode::EmbeddingTimeout,
            AppError::Index { .. } => ErrorCode::IndexError,
            AppError::Generation { .. } => ErrorCode::GenerationError,
            AppError::GenerationTimeout { .. } => ErrorCode::GenerationTimeout,
            AppError::Cancelled => ErrorCode::Cancelled,
            AppError::QueryTimeout { .. } => ErrorCode::QueryTimeout,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::Cache { .. } => ErrorCode::CacheError,
            AppError::HttpClient(_) => ErrorCode::RetrievalError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::MissingField { .. }
            | AppError::InvalidFormat { .. } => StatusCode::BAD_REQUEST,

            // 413 Payload Too Large
            AppError::MessageTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 409 Conflict (session state could not be applied)
            AppError::Session { .. } => StatusCode::CONFLICT,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 499-ish; axum has no canonical client-closed code
            AppError::Cancelled => StatusCode::BAD_REQUEST,

            // 504 Gateway Timeout
            AppError::QueryTimeout { .. }
            | AppError::EmbeddingTimeout { .. }
            | AppError::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Retrieval { .. }
            | AppError::Embedding { .. }
            | AppError::Index { .. }
            | AppError::Generation { .. }
            | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::Cache { .. } | AppError::ServiceUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Stable, user-displayable message. Never includes upstream detail;
    /// the full error is logged server-side instead.
    pub fn client_message(&self) -> String {
        match self {
            AppError::Validation { message, .. } => message.clone(),
            AppError::MissingField { field } => format!("Required field missing: {field}"),
            AppError::InvalidFormat { message } => message.clone(),
            AppError::MessageTooLong { length, limit } => {
                format!("Message too long: {length} chars exceeds limit of {limit}")
            }
            AppError::Session { .. } => "Session could not be restored, starting fresh".into(),
            AppError::RateLimited { retry_after_ms } => {
                format!("Too many requests, retry in {retry_after_ms}ms")
            }
            AppError::Retrieval { .. }
            | AppError::Embedding { .. }
            | AppError::EmbeddingTimeout { .. }
            | AppError::Index { .. } => "Search is temporarily unavailable".into(),
            AppError::Generation { .. } | AppError::GenerationTimeout { .. } => {
                "The assistant could not complete a response".into()
            }
            AppError::Cancelled => "Query cancelled".into(),
            AppError::QueryTimeout { .. } => "Query took too long and was stopped".into(),
            _ => "Something went wrong, please try again".into(),
        }
    }

    /// Milliseconds a client should wait before retrying, if applicable
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
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

/// Structured error response for the REST surface
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Log based on severity; internal detail stays here
        if self.is_server_error() {
            tracing::error!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message: self.client_message(),
                retry_after_ms: self.retry_after_ms(),
                request_id: None, // Filled by middleware
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

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Cache {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::RateLimited { retry_after_ms: 250 };
        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert_eq!(err.code().as_code(), 3001);
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.retry_after_ms(), Some(250));
    }

    #[test]
    fn test_validation_error() {
        let err = AppError::Validation {
            message: "message must not be empty".into(),
            field: Some("message".into()),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.is_server_error());
        assert!(err.is_client_error());
    }

    #[test]
    fn test_client_message_hides_upstream_detail() {
        let err = AppError::Embedding {
            message: "connection refused to 10.0.3.7:8443".into(),
        };
        assert!(!err.client_message().contains("10.0.3.7"));
        assert_eq!(err.code(), ErrorCode::EmbeddingError);
    }

    #[test]
    fn test_server_error() {
        let err = AppError::Internal {
            message: "Something went wrong".into(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.is_server_error());
    }
}
