//! Known states: how much of a CoValue a peer has.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{RawCoId, SessionId};

/// Header presence plus per-session transaction counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueKnownState {
    pub id: RawCoId,
    pub header: bool,
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, u32>,
}

impl CoValueKnownState {
    /// Knows nothing about `id`.
    pub fn empty(id: RawCoId) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Transactions known in `session`.
    pub fn count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Merge another state in, keeping the maximum per session.
    pub fn combine(&mut self, other: &CoValueKnownState) {
        self.header |= other.header;
        for (session, &count) in &other.sessions {
            let entry = self.sessions.entry(session.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Whether `self` covers everything `other` has.
    pub fn covers(&self, other: &CoValueKnownState) -> bool {
        (self.header || !other.header)
            && other
                .sessions
                .iter()
                .all(|(session, &count)| self.count(session) >= count)
    }

    /// Whether `self` reports less than `previous` anywhere.
    pub fn regresses_from(&self, previous: &CoValueKnownState) -> bool {
        !self.covers(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorId;
    use proptest::prelude::*;

    fn session(name: &str) -> SessionId {
        SessionId::new(ActorId::Account(RawCoId::from_bytes([1; 20])), name)
    }

    #[test]
    fn test_combine_takes_maximum() {
        let id = RawCoId::from_bytes([2; 20]);
        let mut a = CoValueKnownState::empty(id);
        a.sessions.insert(session("x"), 3);
        let mut b = CoValueKnownState::empty(id);
        b.header = true;
        b.sessions.insert(session("x"), 1);
        b.sessions.insert(session("y"), 2);

        a.combine(&b);
        assert!(a.header);
        assert_eq!(a.count(&session("x")), 3);
        assert_eq!(a.count(&session("y")), 2);
    }

    #[test]
    fn test_regression_detection() {
        let id = RawCoId::from_bytes([2; 20]);
        let mut before = CoValueKnownState::empty(id);
        before.header = true;
        before.sessions.insert(session("x"), 5);

        let mut after = before.clone();
        after.sessions.insert(session("x"), 2);
        assert!(after.regresses_from(&before));
        assert!(!before.regresses_from(&after));

        let reset = CoValueKnownState::empty(id);
        assert!(reset.regresses_from(&before));
    }

    #[test]
    fn test_wire_shape() {
        let id = RawCoId::from_bytes([2; 20]);
        let mut known = CoValueKnownState::empty(id);
        known.sessions.insert(session("x"), 4);
        let value = serde_json::to_value(&known).unwrap();
        assert_eq!(value["header"], false);
        assert_eq!(value["sessions"][session("x").to_string()], 4);
    }

    fn known_state() -> impl Strategy<Value = CoValueKnownState> {
        (
            any::<bool>(),
            prop::collection::btree_map(
                prop::sample::select(vec!["a", "b", "c"]).prop_map(session),
                0u32..10,
                0..3,
            ),
        )
            .prop_map(|(header, sessions)| CoValueKnownState {
                id: RawCoId::from_bytes([2; 20]),
                header,
                sessions,
            })
    }

    proptest! {
        #[test]
        fn combine_covers_both_and_commutes(a in known_state(), b in known_state()) {
            let mut ab = a.clone();
            ab.combine(&b);
            let mut ba = b.clone();
            ba.combine(&a);

            prop_assert!(ab.covers(&a));
            prop_assert!(ab.covers(&b));
            prop_assert!(ab.covers(&ba) && ba.covers(&ab));
        }
    }
}
