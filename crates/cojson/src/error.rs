//! Error types for the node.

use cojson_core::{CoreError, RawCoId};
use cojson_perms::PermsError;
use cojson_store::StoreError;
use cojson_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Transaction core error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Permission error.
    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The CoValue is not held by this node.
    #[error("CoValue not found: {0}")]
    NotFound(RawCoId),

    /// The CoValue is not a group.
    #[error("not a group: {0}")]
    NotAGroup(RawCoId),

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A peer marked as critical went away; the node refuses further work.
    #[error("node stopped: {0}")]
    Fatal(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
