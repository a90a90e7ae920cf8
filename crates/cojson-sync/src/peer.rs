//! Per-peer state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use cojson_core::{Clock, CoValueKnownState, RawCoId};

use crate::dialect::Dialect;
use crate::error::{Result, SyncError};
use crate::messages::PeerId;
use crate::queue::{OutgoingQueue, QueueConfig};

/// What a peer is to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerRole {
    /// A sync server; receives everything this node has.
    Server,
    /// A client of this node; receives only what it asked for.
    Client,
    /// An equal in a mesh. Like a server, it receives everything and is
    /// asked when loading, after servers.
    Peer,
    /// A storage backend; always synced.
    Storage,
}

impl PeerRole {
    /// Whether every local change is pushed to this peer.
    pub fn receives_all(self) -> bool {
        !matches!(self, PeerRole::Client)
    }

    /// Position among load candidates, lowest asked first. Clients are
    /// never asked.
    pub fn load_rank(self) -> Option<u8> {
        match self {
            PeerRole::Storage => Some(0),
            PeerRole::Server => Some(1),
            PeerRole::Peer => Some(2),
            PeerRole::Client => None,
        }
    }
}

/// Static description of a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub id: PeerId,
    pub role: PeerRole,
    /// Higher is asked first when loading.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub dialect: Dialect,
    /// An unexpected close of this peer is fatal for the node.
    #[serde(default)]
    pub crash_on_close: bool,
}

impl PeerConfig {
    pub fn new(id: impl Into<String>, role: PeerRole) -> Self {
        Self {
            id: PeerId::new(id),
            role,
            priority: 0,
            dialect: Dialect::Native,
            crash_on_close: false,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn crash_on_close(mut self) -> Self {
        self.crash_on_close = true;
        self
    }
}

/// Sync progress of one CoValue with one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
    #[default]
    Unknown,
    /// A pull is outstanding.
    Pulling,
    Synced,
    /// The peer said it does not have the CoValue.
    Unavailable,
}

/// What we believe a peer has of one CoValue.
#[derive(Debug, Clone, Default)]
pub struct PeerKnownState {
    /// Everything the peer told us plus everything we sent since.
    pub optimistic: Option<CoValueKnownState>,
    /// Only what the peer told us.
    pub confirmed: Option<CoValueKnownState>,
    pub phase: SyncPhase,
}

impl PeerKnownState {
    /// Record content we queued for the peer.
    pub fn record_sent(&mut self, sent: &CoValueKnownState) {
        combine_into(&mut self.optimistic, sent);
    }

    /// Record a report from the peer that only adds knowledge.
    pub fn record_confirmed(&mut self, reported: &CoValueKnownState) {
        combine_into(&mut self.confirmed, reported);
        combine_into(&mut self.optimistic, reported);
    }

    /// Record an authoritative report from the peer. If it claims less than
    /// we believed, the belief is reset to the report and
    /// [`SyncError::CorrectionRequired`] tells the caller to re-diff.
    pub fn record_reported(&mut self, peer: &PeerId, reported: &CoValueKnownState) -> Result<()> {
        let regressed = [&self.optimistic, &self.confirmed]
            .into_iter()
            .flatten()
            .any(|believed| reported.regresses_from(believed));
        if regressed {
            self.optimistic = Some(reported.clone());
            self.confirmed = Some(reported.clone());
            return Err(SyncError::CorrectionRequired {
                peer: peer.to_string(),
                id: reported.id,
            });
        }
        self.record_confirmed(reported);
        Ok(())
    }
}

fn combine_into(slot: &mut Option<CoValueKnownState>, other: &CoValueKnownState) {
    match slot {
        Some(known) => known.combine(other),
        None => *slot = Some(other.clone()),
    }
}

/// A connected peer.
#[derive(Debug)]
pub struct PeerEntry {
    pub config: PeerConfig,
    pub known: HashMap<RawCoId, PeerKnownState>,
    pub queue: Arc<OutgoingQueue>,
    pub closed: bool,
}

impl PeerEntry {
    pub fn new(config: PeerConfig, queue: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            known: HashMap::new(),
            queue: Arc::new(OutgoingQueue::new(queue, clock)),
            closed: false,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.config.id
    }

    pub fn role(&self) -> PeerRole {
        self.config.role
    }

    /// State for `id`, created on first use.
    pub fn known_mut(&mut self, id: &RawCoId) -> &mut PeerKnownState {
        self.known.entry(*id).or_default()
    }

    pub fn optimistic(&self, id: &RawCoId) -> Option<&CoValueKnownState> {
        self.known.get(id).and_then(|k| k.optimistic.as_ref())
    }

    pub fn phase(&self, id: &RawCoId) -> SyncPhase {
        self.known.get(id).map(|k| k.phase).unwrap_or_default()
    }
}
