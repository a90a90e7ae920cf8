//! Node configuration.
//!
//! Every field has a default, so a config file only names what it changes:
//!
//! ```json
//! { "loadTimeoutMs": 2000, "sync": { "ping_interval_ms": 5000 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use cojson_sync::SyncConfig;

use crate::error::{NodeError, Result};

/// Configuration for a [`Node`](crate::Node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    /// How long `load` waits for peers before giving up.
    pub load_timeout_ms: u64,
    /// Protocol, queue, keepalive and reconnect settings.
    pub sync: SyncConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 5_000,
            sync: SyncConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parse a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }
}
