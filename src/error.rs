//! Error types for cuboid store operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCutoutArgs,
    InvalidRequest,
    DatatypeDoesNotMatch,
    DataDimensionMismatch,
    ResourceNotFound,
    ObjectNotFound,
    InvalidState,
    UploadQueueNotEmpty,
    IngestQueueNotEmpty,
    TileIndexQueueNotEmpty,
    TileErrorQueueNotEmpty,
    Throttled,
    RequestTooLarge,
    BackendError,
    CorruptData,
    MissingPermission,
    Conflict,
    Timeout,
    SystemError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

/// Main error type for cuboid store operations
#[derive(Error, Debug)]
pub enum BossError {
    #[error("Validation error: {message}")]
    Validation { code: ErrorCode, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state ({state}): {message}")]
    InvalidState {
        code: ErrorCode,
        state: String,
        message: String,
    },

    #[error("{0}")]
    Throttled(String),

    #[error("Request too large: {0}")]
    RequestTooLarge(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt cuboid data: {0}")]
    Corrupt(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Specialized Result type for cuboid store operations
pub type Result<T> = std::result::Result<T, BossError>;

impl BossError {
    pub fn validation(message: impl Into<String>) -> Self {
        BossError::Validation {
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn validation_with(code: ErrorCode, message: impl Into<String>) -> Self {
        BossError::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_state(state: impl fmt::Display, message: impl Into<String>) -> Self {
        BossError::InvalidState {
            code: ErrorCode::InvalidState,
            state: state.to_string(),
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        BossError::Backend(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        BossError::NotFound(message.into())
    }

    /// The machine-readable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            BossError::Validation { code, .. } => *code,
            BossError::NotFound(_) => ErrorCode::ResourceNotFound,
            BossError::InvalidState { code, .. } => *code,
            BossError::Throttled(_) => ErrorCode::Throttled,
            BossError::RequestTooLarge(_) => ErrorCode::RequestTooLarge,
            BossError::Backend(_) | BossError::Io(_) => ErrorCode::BackendError,
            BossError::Corrupt(_) => ErrorCode::CorruptData,
            BossError::Permission(_) => ErrorCode::MissingPermission,
            BossError::Conflict(_) => ErrorCode::Conflict,
            BossError::Timeout(_) => ErrorCode::Timeout,
            BossError::Internal(_) | BossError::Serialization(_) => ErrorCode::SystemError,
        }
    }

    /// HTTP status the edge layer should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            BossError::Validation { .. } => 400,
            BossError::InvalidState { .. } => 400,
            BossError::Permission(_) => 403,
            BossError::NotFound(_) => 404,
            BossError::Conflict(_) => 409,
            BossError::RequestTooLarge(_) => 413,
            BossError::Throttled(_) => 429,
            BossError::Timeout(_) => 504,
            BossError::Backend(_)
            | BossError::Io(_)
            | BossError::Corrupt(_)
            | BossError::Internal(_)
            | BossError::Serialization(_) => 500,
        }
    }

    /// Whether a retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BossError::Backend(_) | BossError::Io(_) | BossError::Timeout(_)
        )
    }

    /// Render as the value returned at the HTTP edge
    pub fn to_response(&self) -> ErrorResponse {
        let metadata = match self {
            BossError::InvalidState { state, .. } => {
                serde_json::json!({ "current_state": state })
            }
            _ => serde_json::Value::Null,
        };
        ErrorResponse {
            status: self.http_status(),
            code: self.code(),
            message: self.to_string(),
            metadata,
        }
    }
}

/// Error value carried to the HTTP layer: `{code, message, metadata}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl From<bincode::Error> for BossError {
    fn from(err: bincode::Error) -> Self {
        BossError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for BossError {
    fn from(err: serde_json::Error) -> Self {
        BossError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BossError {
    fn from(err: tokio::task::JoinError) -> Self {
        BossError::Internal(format!("worker task failed: {}", err))
    }
}
