//! Error types for the sync module.

use thiserror::Error;

use cojson_core::{CoreError, RawCoId};

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer hung up or was closed locally.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    /// No frame arrived within the ping timeout.
    #[error("ping timeout for peer {0}")]
    PingTimeout(String),

    /// The peer reported less of a CoValue than previously believed.
    #[error("known state of {id} regressed for peer {peer}")]
    CorrectionRequired { peer: String, id: RawCoId },

    /// The storage backend cannot be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// No peer with this id is registered.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Applying content failed in the core.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
