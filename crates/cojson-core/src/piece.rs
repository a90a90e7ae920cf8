//! Content pieces: the unit of CoValue content sent between peers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::Signature;
use crate::header::CoValueHeader;
use crate::known::CoValueKnownState;
use crate::priority::Priority;
use crate::session::MAX_RECOMMENDED_TX_SIZE;
use crate::transaction::Transaction;
use crate::types::{RawCoId, SessionId};

/// New transactions of one session, starting at index `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    pub after: u32,
    pub new_transactions: Vec<Transaction>,
    pub last_signature: Signature,
}

impl SessionNewContent {
    fn size_estimate(&self) -> usize {
        self.new_transactions
            .iter()
            .map(Transaction::size_estimate)
            .sum::<usize>()
            + 160
    }
}

/// A chunk of CoValue content: optionally the header, plus per-session
/// transaction runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContentPiece {
    pub id: RawCoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub low_priority: bool,
    pub new: BTreeMap<SessionId, SessionNewContent>,
}

impl NewContentPiece {
    pub fn new(id: RawCoId, header: Option<CoValueHeader>, priority: Priority) -> Self {
        Self {
            id,
            header,
            priority,
            low_priority: priority.is_low(),
            new: BTreeMap::new(),
        }
    }

    /// Whether the piece carries nothing.
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.values().all(|s| s.new_transactions.is_empty())
    }

    /// Number of transactions in the piece.
    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }

    /// What a receiver that applied this piece is known to have.
    pub fn known_state_after(&self) -> CoValueKnownState {
        let mut known = CoValueKnownState::empty(self.id);
        known.header = self.header.is_some();
        for (session, content) in &self.new {
            known
                .sessions
                .insert(session.clone(), content.after + content.new_transactions.len() as u32);
        }
        known
    }

    fn size_estimate(&self) -> usize {
        self.new.values().map(SessionNewContent::size_estimate).sum::<usize>() + 256
    }
}

/// Pack per-session segments into pieces of bounded size.
///
/// Segments of one session stay in order and never share a piece, so each
/// piece can be applied on its own once the previous ones were applied. The
/// header, when given, travels in the first piece.
pub fn pack_pieces(
    id: RawCoId,
    header: Option<CoValueHeader>,
    priority: Priority,
    sessions: Vec<(SessionId, Vec<SessionNewContent>)>,
) -> Vec<NewContentPiece> {
    let mut pieces = Vec::new();
    let mut current = NewContentPiece::new(id, header, priority);

    for (session_id, segments) in sessions {
        for segment in segments {
            let would_overflow = !current.new.is_empty()
                && current.size_estimate() + segment.size_estimate() > MAX_RECOMMENDED_TX_SIZE;
            if current.new.contains_key(&session_id) || would_overflow {
                let next = NewContentPiece::new(id, None, priority);
                pieces.push(std::mem::replace(&mut current, next));
            }
            current.new.insert(session_id.clone(), segment);
        }
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use crate::types::ActorId;
    use serde_json::json;

    fn session(name: &str) -> SessionId {
        SessionId::new(ActorId::Agent(AgentSecret::from_seed(&[1; 32]).id()), name)
    }

    fn segment(after: u32, n: usize, payload: usize) -> SessionNewContent {
        let tx = Transaction::trusting(0, &[json!("x".repeat(payload))]).unwrap();
        SessionNewContent {
            after,
            new_transactions: vec![tx; n],
            last_signature: Signature::from_bytes([0; 64]),
        }
    }

    #[test]
    fn test_small_sessions_share_a_piece() {
        let id = RawCoId::from_bytes([1; 20]);
        let pieces = pack_pieces(
            id,
            None,
            Priority::MEDIUM,
            vec![
                (session("a"), vec![segment(0, 2, 10)]),
                (session("b"), vec![segment(3, 1, 10)]),
            ],
        );
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].transaction_count(), 3);
        let known = pieces[0].known_state_after();
        assert_eq!(known.sessions[&session("b")], 4);
    }

    #[test]
    fn test_segments_of_one_session_split() {
        let id = RawCoId::from_bytes([1; 20]);
        let pieces = pack_pieces(
            id,
            None,
            Priority::MEDIUM,
            vec![(session("a"), vec![segment(0, 1, 10), segment(1, 1, 10)])],
        );
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[1].new[&session("a")].after, 1);
    }

    #[test]
    fn test_large_content_is_chunked() {
        let id = RawCoId::from_bytes([1; 20]);
        let pieces = pack_pieces(
            id,
            None,
            Priority::LOW,
            vec![
                (session("a"), vec![segment(0, 1, 80 * 1024)]),
                (session("b"), vec![segment(0, 1, 80 * 1024)]),
            ],
        );
        assert_eq!(pieces.len(), 2);
        assert!(pieces.iter().all(|p| p.low_priority));
    }

    #[test]
    fn test_header_only_piece() {
        let id = RawCoId::from_bytes([1; 20]);
        let header = CoValueHeader::new(
            crate::header::CoValueType::CoMap,
            crate::header::Ruleset::UnsafeAllowAll,
            0,
        );
        let pieces = pack_pieces(id, Some(header), Priority::MEDIUM, vec![]);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].header.is_some());
        assert!(pack_pieces(id, None, Priority::MEDIUM, vec![]).is_empty());
    }
}
