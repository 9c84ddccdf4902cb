//! Error types for the sync engine.

use contact_sync_protocol::{AccountId, ProtocolError};
use contact_sync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or remote service error.
    #[error("remote error: {message}")]
    Remote {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A record could not be built for one account.
    #[error("failed to build record for account {account}: {message}")]
    Build {
        /// The account whose record failed.
        account: AccountId,
        /// Error message.
        message: String,
    },

    /// The manifest could not be built or encoded.
    #[error("manifest serialization failed: {0}")]
    Serialization(String),

    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Persisted sync state could not be decoded.
    #[error("corrupted sync state: {0}")]
    Corrupted(String),

    /// Every attempt of an operation failed.
    #[error("{kind} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// The kind of work that failed.
        kind: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last: Box<SyncError>,
    },

    /// The engine stopped before the operation ran.
    #[error("sync engine stopped")]
    EngineStopped,
}

impl SyncError {
    /// Creates a retryable remote error.
    pub fn remote_retryable(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable remote error.
    pub fn remote_fatal(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a build error for `account`.
    pub fn build(account: AccountId, message: impl Into<String>) -> Self {
        Self::Build {
            account,
            message: message.into(),
        }
    }

    /// Returns true if this error can be retried.
    ///
    /// Local failures (serialization, storage, corrupted state) are retried
    /// too: they consume attempts and surface once the budget is spent.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote { retryable, .. } => *retryable,
            SyncError::Serialization(_) => true,
            SyncError::Storage(_) => true,
            SyncError::Corrupted(_) => true,
            SyncError::Build { .. } => false,
            SyncError::RetriesExhausted { .. } => false,
            SyncError::EngineStopped => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::InvalidManifest(message) | ProtocolError::Encoding(message) => {
                SyncError::Serialization(message)
            }
            other => SyncError::Corrupted(other.to_string()),
        }
    }
}
