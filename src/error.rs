//! Error types for the memory service

use thiserror::Error;

/// Result type alias for memory-service operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Main error type for the memory service
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Content could not be decrypted")]
    DecryptionFailure,

    #[error("Embedding endpoint failure ({model}): {message}")]
    EmbeddingEndpointFailure { model: String, message: String },

    #[error("Requested dimension {requested} does not match returned dimension {actual}")]
    DimensionMismatch { requested: usize, actual: usize },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Migration failed at step {step}: {message}")]
    MigrationFailure { step: String, message: String },

    #[error("Token tracking failed: {0}")]
    TokenTrackingFailure(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Whether a caller could reasonably retry this operation unmodified.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoryError::EmbeddingEndpointFailure { .. } | MemoryError::Http(_)
        )
    }

    /// Stable error code surfaced in the MCP error envelope.
    pub fn code(&self) -> i64 {
        match self {
            MemoryError::NotFound(_) => -32001,
            MemoryError::InvalidParameter(_) => -32602,
            MemoryError::Unauthorized(_) => -32003,
            MemoryError::DecryptionFailure => -32010,
            MemoryError::EmbeddingEndpointFailure { .. } => -32011,
            MemoryError::DimensionMismatch { .. } => -32012,
            MemoryError::MigrationFailure { .. } => -32013,
            MemoryError::TokenTrackingFailure(_) => -32014,
            _ => -32000,
        }
    }

    /// Shape surfaced to tool callers. Only `InvalidParameter` gets the
    /// `{error: "Invalid parameter", details}` form AI callers are meant to
    /// self-correct on (§7); every other kind reports its own message as
    /// `error` so a caller can tell "fix your input" apart from "not found",
    /// "can't decrypt", or "your credential is dead".
    pub fn as_tool_error(&self) -> serde_json::Value {
        match self {
            MemoryError::InvalidParameter(details) => serde_json::json!({
                "error": "Invalid parameter",
                "details": details,
            }),
            other => serde_json::json!({ "error": other.to_string() }),
        }
    }
}
