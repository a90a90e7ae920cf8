//! Error types for the cojson core.

use thiserror::Error;

use crate::types::{RawCoId, SessionId};

/// Errors raised by the cryptographic primitives.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("malformed {kind}: {value}")]
    Malformed { kind: &'static str, value: String },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

/// Errors raised by the transaction core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature for session {0}")]
    InvalidSignature(SessionId),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("out of order transaction in {session}: have {expected}, got after={got}")]
    OutOfOrderTransaction {
        session: SessionId,
        expected: u32,
        got: u32,
    },

    #[error("unknown CoValue type: {0}")]
    UnknownCoValueType(String),

    #[error("missing header for {0}")]
    MissingHeader(RawCoId),

    #[error("missing dependency {0}")]
    MissingDependency(RawCoId),

    #[error("header does not hash to {0}")]
    HeaderMismatch(RawCoId),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl CoreError {
    /// Whether the error means the sender and receiver disagree about
    /// how much of the CoValue the receiver has.
    pub fn needs_correction(&self) -> bool {
        matches!(
            self,
            CoreError::OutOfOrderTransaction { .. } | CoreError::MissingHeader(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Encoding(e.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
