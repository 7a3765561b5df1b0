//! Error types for the event storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse failure classes callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request or bad setup; retrying will not help.
    Configuration,
    /// A persisted blob (or a column handed to the indexer) cannot be decoded.
    CorruptData,
    /// Oversized or contended storage transaction; retry may succeed.
    TransientStorage,
    /// Everything else (I/O, cancellation, shutdown).
    Internal,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Invalid regex for column '{column}': {reason}")]
    InvalidRegex { column: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Corrupt data at '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported column '{column}': {reason}")]
    UnsupportedColumn { column: String, reason: String },

    #[error("Transaction too large: {size} bytes exceeds limit of {limit}")]
    TransactionTooLarge { size: usize, limit: usize },

    #[error("Storage busy")]
    StorageBusy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Engine is closed")]
    Closed,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::UnknownColumn(_)
            | EngineError::SchemaMismatch(_)
            | EngineError::InvalidSchema(_)
            | EngineError::InvalidRegex { .. }
            | EngineError::Config(_) => ErrorKind::Configuration,
            EngineError::Corrupt { .. }
            | EngineError::InvalidFormat(_)
            | EngineError::UnsupportedColumn { .. } => ErrorKind::CorruptData,
            EngineError::TransactionTooLarge { .. } | EngineError::StorageBusy => {
                ErrorKind::TransientStorage
            }
            _ => ErrorKind::Internal,
        }
    }

    /// Get error code for callers that surface errors over a wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnknownColumn(_) => "UNKNOWN_COLUMN",
            EngineError::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            EngineError::InvalidRegex { .. } => "INVALID_REGEX",
            EngineError::Corrupt { .. } | EngineError::InvalidFormat(_) => "CORRUPT_DATA",
            EngineError::TransactionTooLarge { .. } => "TXN_TOO_LARGE",
            EngineError::StorageBusy => "STORAGE_BUSY",
            EngineError::Cancelled => "CANCELLED",
            EngineError::Closed => "CLOSED",
            _ => "INTERNAL_ERROR",
        }
    }

    pub(crate) fn corrupt(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        EngineError::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
