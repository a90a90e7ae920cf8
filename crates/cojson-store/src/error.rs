//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Header or transaction (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A row refers to something that is not there.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The store lock was poisoned or a blocking task died.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Protocol-level failure while serving as a peer.
    #[error(transparent)]
    Sync(#[from] cojson_sync::SyncError),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<cojson_core::CryptoError> for StoreError {
    fn from(e: cojson_core::CryptoError) -> Self {
        StoreError::InvalidData(e.to_string())
    }
}

impl From<StoreError> for cojson_sync::SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Sync(inner) => inner,
            other => cojson_sync::SyncError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
