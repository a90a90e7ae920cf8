//! Sync protocol message types.
//!
//! One JSON object per message; the `action` field discriminates. Native
//! peers speak `pull`, `push`, `data`, `ack` and `known`. Legacy peers
//! speak `load`, `content`, `known` and `done`, which [`crate::dialect`]
//! maps onto the native set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use cojson_core::{CoValueKnownState, NewContentPiece, Priority, RawCoId, SessionId};

/// Identifier of a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Message size limits.
pub mod limits {
    /// Largest frame accepted from a peer.
    pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
    /// Default ceiling for one outgoing batch.
    pub const DEFAULT_MAX_BATCH_BYTES: usize = 64 * 1024;
}

/// A peer's report of how much of a CoValue it has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownMessage {
    pub id: RawCoId,
    pub header: bool,
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, u32>,
    /// Sent when the receiver's belief about the sender was wrong.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_correction: bool,
    /// The CoValue whose sync made this one necessary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_dependency_of: Option<RawCoId>,
}

impl KnownMessage {
    pub fn new(known: CoValueKnownState) -> Self {
        Self {
            id: known.id,
            header: known.header,
            sessions: known.sessions,
            is_correction: false,
            as_dependency_of: None,
        }
    }

    /// A correction: "this is what I really have".
    pub fn correction(known: CoValueKnownState) -> Self {
        Self {
            is_correction: true,
            ..Self::new(known)
        }
    }

    pub fn known_state(&self) -> CoValueKnownState {
        CoValueKnownState {
            id: self.id,
            header: self.header,
            sessions: self.sessions.clone(),
        }
    }
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncMessage {
    /// "Tell me what I'm missing."
    #[serde(rename_all = "camelCase")]
    Pull {
        /// What the sender has.
        known_state: CoValueKnownState,
    },

    /// New content, plus the sender's knowledge so the receiver can
    /// reciprocate.
    #[serde(rename_all = "camelCase")]
    Push {
        known_state: CoValueKnownState,
        content: NewContentPiece,
    },

    /// Response to a pull.
    #[serde(rename_all = "camelCase")]
    Data {
        known_state: CoValueKnownState,
        /// False when the sender does not have the CoValue at all.
        known: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<NewContentPiece>,
    },

    /// "I applied what you pushed; this is what I have now."
    #[serde(rename_all = "camelCase")]
    Ack { known_state: CoValueKnownState },

    /// Plain known-state report, also used for corrections.
    Known(KnownMessage),

    /// Legacy request carrying the sender's known state.
    Load(CoValueKnownState),

    /// Legacy content delivery.
    Content(NewContentPiece),

    /// Legacy end-of-stream marker.
    Done { id: RawCoId },
}

impl SyncMessage {
    /// The CoValue this message is about.
    pub fn id(&self) -> &RawCoId {
        match self {
            SyncMessage::Pull { known_state }
            | SyncMessage::Push { known_state, .. }
            | SyncMessage::Data { known_state, .. }
            | SyncMessage::Ack { known_state }
            | SyncMessage::Load(known_state) => &known_state.id,
            SyncMessage::Known(known) => &known.id,
            SyncMessage::Content(piece) => &piece.id,
            SyncMessage::Done { id } => id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Pull { .. } => "pull",
            SyncMessage::Push { .. } => "push",
            SyncMessage::Data { .. } => "data",
            SyncMessage::Ack { .. } => "ack",
            SyncMessage::Known(_) => "known",
            SyncMessage::Load(_) => "load",
            SyncMessage::Content(_) => "content",
            SyncMessage::Done { .. } => "done",
        }
    }

    /// The content piece carried, if any.
    pub fn content(&self) -> Option<&NewContentPiece> {
        match self {
            SyncMessage::Push { content, .. } | SyncMessage::Content(content) => Some(content),
            SyncMessage::Data { content, .. } => content.as_ref(),
            _ => None,
        }
    }

    /// Outgoing queue priority: control messages are HIGH, content takes
    /// the priority of its CoValue.
    pub fn priority(&self) -> Priority {
        self.content().map(|c| c.priority).unwrap_or(Priority::HIGH)
    }
}
