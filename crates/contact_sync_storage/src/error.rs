//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The persisted image could not be decoded.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A stored value has the wrong shape for the requested type.
    #[error("invalid value for {collection}/{key}: {message}")]
    InvalidValue {
        /// Collection holding the value.
        collection: String,
        /// Key of the value.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// Another process holds the store directory lock.
    #[error("storage directory is locked by another process")]
    Locked,

    /// A write was rejected by the backend (used for failure injection).
    #[error("persist rejected: {0}")]
    PersistRejected(String),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
