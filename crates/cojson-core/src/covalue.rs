//! CoValueCore: header plus session logs of one CoValue.
//!
//! [`CoValueCore::try_add_transactions`] is the only way transactions enter
//! a core. It checks ordering, verifies the session signature against the
//! signers the [`Authorizer`] resolves for the session's actor, and lets the
//! authorizer admit or deny the batch before anything is appended.

use std::collections::BTreeMap;

use tracing::debug;

use crate::crypto::{Signature, SignerId, SignerSecret};
use crate::error::{CoreError, Result};
use crate::header::CoValueHeader;
use crate::known::CoValueKnownState;
use crate::piece::{pack_pieces, NewContentPiece};
use crate::session::{AppendOutcome, SessionLog};
use crate::transaction::Transaction;
use crate::types::{ActorId, CausalPoint, RawCoId, SessionId, TransactionId};

/// Decides who may sign for an actor and whether a batch may be admitted.
pub trait Authorizer {
    /// Signing keys that may sign sessions of `actor`.
    fn signers_for(&self, core: &CoValueCore, actor: &ActorId) -> Result<Vec<SignerId>>;

    /// Admit or deny transactions about to be appended to `session` at
    /// `first_index`.
    fn admit(
        &self,
        core: &CoValueCore,
        session: &SessionId,
        first_index: u32,
        txs: &[Transaction],
    ) -> Result<()>;
}

/// Admits everything signed by an agent. Accounts cannot be resolved.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn signers_for(&self, _core: &CoValueCore, actor: &ActorId) -> Result<Vec<SignerId>> {
        match actor {
            ActorId::Agent(agent) => Ok(vec![agent.signer]),
            ActorId::Account(account) => Err(CoreError::MissingDependency(*account)),
        }
    }

    fn admit(&self, _: &CoValueCore, _: &SessionId, _: u32, _: &[Transaction]) -> Result<()> {
        Ok(())
    }
}

/// A transaction together with its position.
#[derive(Debug, Clone, Copy)]
pub struct TransactionRef<'a> {
    pub session_id: &'a SessionId,
    pub tx_index: u32,
    pub tx: &'a Transaction,
}

impl TransactionRef<'_> {
    pub fn tx_id(&self) -> TransactionId {
        TransactionId::new(self.session_id.clone(), self.tx_index)
    }

    pub fn causal_point(&self) -> CausalPoint {
        CausalPoint {
            made_at: self.tx.made_at(),
            session_id: self.session_id.clone(),
            tx_index: self.tx_index,
        }
    }
}

/// The mutable state of one CoValue.
#[derive(Debug, Clone)]
pub struct CoValueCore {
    id: RawCoId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
}

impl CoValueCore {
    /// Create an empty core; its id is derived from the header.
    pub fn new(header: CoValueHeader) -> Result<Self> {
        let id = header.id()?;
        Ok(Self {
            id,
            header,
            sessions: BTreeMap::new(),
        })
    }

    /// Create a core for a header received under a claimed id.
    pub fn from_received(id: RawCoId, header: CoValueHeader) -> Result<Self> {
        let core = Self::new(header)?;
        if core.id != id {
            return Err(CoreError::HeaderMismatch(id));
        }
        Ok(core)
    }

    pub fn id(&self) -> &RawCoId {
        &self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionLog> {
        self.sessions.values()
    }

    /// Index the next transaction of `session` will get.
    pub fn next_tx_index(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).map(SessionLog::len).unwrap_or(0)
    }

    /// `madeAt` of the last transaction in `session`.
    pub fn last_made_at(&self, session: &SessionId) -> Option<i64> {
        self.sessions
            .get(session)?
            .transactions()
            .last()
            .map(Transaction::made_at)
    }

    pub fn known_state(&self) -> CoValueKnownState {
        CoValueKnownState {
            id: self.id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .map(|(id, log)| (id.clone(), log.len()))
                .collect(),
        }
    }

    /// Actors that authored at least one session.
    pub fn authors(&self) -> Vec<ActorId> {
        let mut authors: Vec<ActorId> = self.sessions.keys().map(|s| *s.actor()).collect();
        authors.sort();
        authors.dedup();
        authors
    }

    /// Sign `txs` as the continuation of `session`.
    pub fn sign_transactions(
        &self,
        session: &SessionId,
        txs: &[Transaction],
        signer: &SignerSecret,
    ) -> Result<Signature> {
        match self.sessions.get(session) {
            Some(log) => log.sign_next(txs, signer),
            None => SessionLog::new(&self.id, session.clone()).sign_next(txs, signer),
        }
    }

    /// Verify and append transactions to `session`, starting at `after`.
    pub fn try_add_transactions(
        &mut self,
        auth: &dyn Authorizer,
        session: &SessionId,
        after: u32,
        txs: &[Transaction],
        signature: Signature,
    ) -> Result<AppendOutcome> {
        let fresh;
        let log = match self.sessions.get(session) {
            Some(log) => log,
            None => {
                fresh = SessionLog::new(&self.id, session.clone());
                &fresh
            }
        };

        let suffix = log.new_suffix(after, txs)?;
        if suffix.is_empty() {
            return Ok(AppendOutcome::Duplicate);
        }

        let signers = auth.signers_for(self, session.actor())?;
        let prepared = log.prepare(suffix, signature, &signers)?;
        auth.admit(self, session, log.len(), prepared.transactions())?;

        debug!(
            co_value = %self.id,
            session = %session,
            count = suffix.len(),
            "appending transactions"
        );
        let log = self
            .sessions
            .entry(session.clone())
            .or_insert_with(|| SessionLog::new(&self.id, session.clone()));
        Ok(log.commit(prepared))
    }

    /// Every transaction, ordered by `(madeAt, sessionId, txIndex)`.
    pub fn transactions_in_causal_order(&self) -> Vec<TransactionRef<'_>> {
        let mut all: Vec<TransactionRef<'_>> = self
            .sessions
            .iter()
            .flat_map(|(session_id, log)| {
                log.transactions()
                    .iter()
                    .enumerate()
                    .map(move |(i, tx)| TransactionRef {
                        session_id,
                        tx_index: i as u32,
                        tx,
                    })
            })
            .collect();
        all.sort_by(|a, b| {
            (a.tx.made_at(), a.session_id, a.tx_index).cmp(&(
                b.tx.made_at(),
                b.session_id,
                b.tx_index,
            ))
        });
        all
    }

    /// Content a peer with `known` is missing, or `None` if it has it all.
    ///
    /// Never includes a transaction the peer's known state already covers.
    pub fn new_content_since(
        &self,
        known: Option<&CoValueKnownState>,
    ) -> Option<Vec<NewContentPiece>> {
        let send_header = !known.map(|k| k.header).unwrap_or(false);
        let sessions: Vec<_> = self
            .sessions
            .iter()
            .filter_map(|(session_id, log)| {
                let from = known.map(|k| k.count(session_id)).unwrap_or(0);
                let segments = log.segments_since(from);
                (!segments.is_empty()).then(|| (session_id.clone(), segments))
            })
            .collect();

        let header = send_header.then(|| self.header.clone());
        let pieces = pack_pieces(self.id, header, self.header.priority(), sessions);
        (!pieces.is_empty()).then_some(pieces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use crate::header::{CoValueType, Ruleset};
    use serde_json::json;

    struct DenyAll;

    impl Authorizer for DenyAll {
        fn signers_for(&self, core: &CoValueCore, actor: &ActorId) -> Result<Vec<SignerId>> {
            AllowAll.signers_for(core, actor)
        }

        fn admit(&self, _: &CoValueCore, _: &SessionId, _: u32, _: &[Transaction]) -> Result<()> {
            Err(CoreError::PermissionDenied("read-only".into()))
        }
    }

    fn setup() -> (AgentSecret, SessionId, CoValueCore) {
        let agent = AgentSecret::generate();
        let session = SessionId::new(ActorId::Agent(agent.id()), "s1");
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, 0);
        (agent, session, CoValueCore::new(header).unwrap())
    }

    fn set(key: &str, value: i64, at: i64) -> Transaction {
        Transaction::trusting(at, &[json!({"op": "set", "key": key, "value": value})]).unwrap()
    }

    fn add(core: &mut CoValueCore, agent: &AgentSecret, session: &SessionId, txs: Vec<Transaction>) {
        let after = core.next_tx_index(session);
        let sig = core.sign_transactions(session, &txs, &agent.signer).unwrap();
        core.try_add_transactions(&AllowAll, session, after, &txs, sig)
            .unwrap();
    }

    #[test]
    fn test_add_and_known_state() {
        let (agent, session, mut core) = setup();
        add(&mut core, &agent, &session, vec![set("a", 1, 1), set("b", 2, 2)]);
        let known = core.known_state();
        assert!(known.header);
        assert_eq!(known.count(&session), 2);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let (agent, session, mut core) = setup();
        let txs = vec![set("a", 1, 1)];
        let sig = core.sign_transactions(&session, &txs, &agent.signer).unwrap();
        core.try_add_transactions(&AllowAll, &session, 0, &txs, sig).unwrap();
        let before = core.known_state();

        let again = core.try_add_transactions(&AllowAll, &session, 0, &txs, sig).unwrap();
        assert_eq!(again, AppendOutcome::Duplicate);
        assert_eq!(core.known_state(), before);
    }

    #[test]
    fn test_denied_batch_is_not_applied() {
        let (agent, session, mut core) = setup();
        let txs = vec![set("a", 1, 1)];
        let sig = core.sign_transactions(&session, &txs, &agent.signer).unwrap();
        let err = core
            .try_add_transactions(&DenyAll, &session, 0, &txs, sig)
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));
        assert_eq!(core.next_tx_index(&session), 0);
    }

    #[test]
    fn test_forged_signature_rejected() {
        let (agent, session, mut core) = setup();
        let txs = vec![set("a", 1, 1)];
        let forged = core
            .sign_transactions(&session, &txs, &AgentSecret::generate().signer)
            .unwrap();
        let err = core
            .try_add_transactions(&AllowAll, &session, 0, &txs, forged)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidSignature(_)));

        add(&mut core, &agent, &session, txs);
        assert_eq!(core.next_tx_index(&session), 1);
    }

    #[test]
    fn test_gap_is_out_of_order() {
        let (agent, session, mut core) = setup();
        let txs = vec![set("a", 1, 1)];
        let sig = core.sign_transactions(&session, &txs, &agent.signer).unwrap();
        let err = core
            .try_add_transactions(&AllowAll, &session, 2, &txs, sig)
            .unwrap_err();
        assert!(err.needs_correction());
    }

    #[test]
    fn test_received_header_must_match_id() {
        let (_, _, core) = setup();
        let other = RawCoId::from_bytes([0; 20]);
        assert!(CoValueCore::from_received(other, core.header().clone()).is_err());
        assert!(CoValueCore::from_received(*core.id(), core.header().clone()).is_ok());
    }

    #[test]
    fn test_new_content_since_is_minimal() {
        let (agent, session, mut core) = setup();
        add(&mut core, &agent, &session, vec![set("a", 1, 1), set("b", 2, 2)]);

        let everything = core.new_content_since(None).unwrap();
        assert!(everything[0].header.is_some());
        assert_eq!(everything[0].transaction_count(), 2);

        let mut known = core.known_state();
        assert!(core.new_content_since(Some(&known)).is_none());

        known.sessions.insert(session.clone(), 1);
        let rest = core.new_content_since(Some(&known)).unwrap();
        assert!(rest[0].header.is_none());
        assert_eq!(rest[0].new[&session].after, 1);
        assert_eq!(rest[0].transaction_count(), 1);
    }

    #[test]
    fn test_causal_order_interleaves_sessions() {
        let (agent, session, mut core) = setup();
        let other = SessionId::new(ActorId::Agent(agent.id()), "s2");
        add(&mut core, &agent, &session, vec![set("a", 1, 10), set("a", 2, 30)]);
        add(&mut core, &agent, &other, vec![set("a", 3, 20)]);

        let order: Vec<i64> = core
            .transactions_in_causal_order()
            .iter()
            .map(|t| t.tx.made_at())
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }
}
