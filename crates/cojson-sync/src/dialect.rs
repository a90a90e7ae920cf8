//! Legacy message dialect.
//!
//! Peers that predate `pull`/`push`/`data`/`ack` speak `load`, `content`,
//! `known` and `done`. Outgoing native messages are rewritten for them and
//! their incoming messages are normalized before the protocol sees them.

use serde::{Deserialize, Serialize};

use cojson_core::CoValueKnownState;

use crate::messages::{KnownMessage, SyncMessage};

/// Message set a peer understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dialect {
    #[default]
    Native,
    Legacy,
}

impl Dialect {
    /// Messages to put on the wire for `message`.
    pub fn outgoing(self, message: SyncMessage) -> Vec<SyncMessage> {
        match self {
            Dialect::Native => vec![message],
            Dialect::Legacy => to_legacy(message),
        }
    }

    /// The native form of an incoming message, or `None` if it carries
    /// nothing the protocol acts on.
    pub fn incoming(self, message: SyncMessage) -> Option<SyncMessage> {
        from_legacy(message)
    }
}

fn to_legacy(message: SyncMessage) -> Vec<SyncMessage> {
    match message {
        SyncMessage::Pull { known_state } => vec![SyncMessage::Load(known_state)],
        SyncMessage::Push {
            known_state,
            content,
        } => vec![SyncMessage::Load(known_state), SyncMessage::Content(content)],
        SyncMessage::Data {
            known_state,
            known,
            content,
        } => match (known, content) {
            (true, Some(content)) => vec![SyncMessage::Content(content)],
            (true, None) => vec![SyncMessage::Known(KnownMessage::new(known_state))],
            (false, _) => vec![SyncMessage::Known(KnownMessage::new(
                CoValueKnownState::empty(known_state.id),
            ))],
        },
        SyncMessage::Ack { known_state } => vec![SyncMessage::Known(KnownMessage::new(known_state))],
        other => vec![other],
    }
}

/// Native messages pass through unchanged, so a peer switching dialects
/// mid-connection is still understood.
fn from_legacy(message: SyncMessage) -> Option<SyncMessage> {
    match message {
        SyncMessage::Load(known_state) => Some(SyncMessage::Pull { known_state }),
        SyncMessage::Content(content) => Some(SyncMessage::Push {
            known_state: content.known_state_after(),
            content,
        }),
        SyncMessage::Done { .. } => None,
        other => Some(other),
    }
}
