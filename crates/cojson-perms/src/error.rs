//! Error types for the group permission model.

use cojson_core::{CoreError, CryptoError, KeyId};
use thiserror::Error;

/// Errors that can occur while evaluating or editing groups.
#[derive(Debug, Error)]
pub enum PermsError {
    /// The author lacks the role a change needs.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A role string that is not part of the model.
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// The CoValue is not a group.
    #[error("not a group: {0}")]
    NotAGroup(String),

    /// No reveal of this key is reachable for the reader.
    #[error("key unavailable: {0}")]
    KeyUnavailable(KeyId),

    /// The group has no `readKey` yet.
    #[error("group has no read key")]
    NoReadKey,

    /// A member whose sealer cannot be resolved.
    #[error("unknown sealer for {0}")]
    UnknownSealer(String),

    /// Malformed invite secret.
    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    /// Encryption error.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Decryption error.
    #[error("decryption error: {0}")]
    Decryption(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Crypto primitive error.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Core error.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<PermsError> for CoreError {
    fn from(e: PermsError) -> Self {
        match e {
            PermsError::Core(inner) => inner,
            PermsError::Crypto(inner) => CoreError::Crypto(inner),
            other => CoreError::PermissionDenied(other.to_string()),
        }
    }
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
