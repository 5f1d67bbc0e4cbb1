//! Error types for the courier-store crate.

use std::io;

use courier_common::MessageId;
use thiserror::Error;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (file read/write/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// Store directory validation failed.
    #[error("Store validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Internal error (lock poisoning, injected failures, etc.).
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Store capacity exceeded: {used}/{capacity} messages")]
    CapacityExceeded { used: usize, capacity: usize },
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Attempt log line could not be read or written.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored data is corrupted or incomplete.
    #[error("Corrupted data: {0}")]
    Corrupted(String),
}

/// Store directory validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Store path cannot contain '..' components: {0}")]
    ParentTraversal(String),

    #[error("Store path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Store path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    #[error("Store path is not a directory: {0}")]
    NotDirectory(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.into())
    }
}

// Convenience conversion for lock poisoning
impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}
