//! Session logs: the strictly ordered, incrementally signed transaction
//! stream of one session within one CoValue.

use std::collections::BTreeMap;

use crate::crypto::{Blake3Hash, Signature, SignerId, SignerSecret};
use crate::error::{CoreError, Result};
use crate::piece::SessionNewContent;
use crate::transaction::Transaction;
use crate::types::{RawCoId, SessionId};

/// Serialized size after which a signature checkpoint is recorded.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

const SESSION_HASH_DOMAIN: &[u8] = b"cojson-session-v0:";

/// Outcome of appending to a session log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New transactions were appended.
    Appended { count: usize },
    /// Everything offered was already present.
    Duplicate,
}

/// A signature-checked batch that is ready to be committed.
#[derive(Debug)]
pub struct PreparedAppend {
    transactions: Vec<Transaction>,
    hasher: blake3::Hasher,
    signature: Signature,
    size: usize,
}

impl PreparedAppend {
    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }
}

/// The transactions of one session.
#[derive(Debug, Clone)]
pub struct SessionLog {
    session_id: SessionId,
    transactions: Vec<Transaction>,
    last_signature: Option<Signature>,
    /// Running hash over every transaction so far.
    hasher: blake3::Hasher,
    /// Signatures that cover the session up to and including the given index.
    signature_after: BTreeMap<u32, Signature>,
    bytes_since_checkpoint: usize,
}

impl SessionLog {
    /// Create an empty log. The hash is bound to the CoValue and session.
    pub fn new(co_id: &RawCoId, session_id: SessionId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(SESSION_HASH_DOMAIN);
        hasher.update(co_id.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(session_id.as_str().as_bytes());
        Self {
            session_id,
            transactions: Vec::new(),
            last_signature: None,
            hasher,
            signature_after: BTreeMap::new(),
            bytes_since_checkpoint: 0,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Number of transactions.
    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    pub fn signature_checkpoints(&self) -> &BTreeMap<u32, Signature> {
        &self.signature_after
    }

    /// Hash state after appending `txs` to the current log.
    fn hash_with(&self, txs: &[Transaction]) -> Result<(blake3::Hasher, Blake3Hash)> {
        let mut hasher = self.hasher.clone();
        for tx in txs {
            hasher.update(&tx.signing_bytes()?);
        }
        let hash = Blake3Hash::from(hasher.finalize());
        Ok((hasher, hash))
    }

    /// Sign the log as it would be after appending `txs`.
    pub fn sign_next(&self, txs: &[Transaction], signer: &SignerSecret) -> Result<Signature> {
        let (_, hash) = self.hash_with(txs)?;
        Ok(signer.sign(hash.as_bytes()))
    }

    /// The part of an incoming batch starting at `after` that is not yet
    /// stored. Overlap is dropped; a gap is an error.
    pub fn new_suffix<'a>(&self, after: u32, txs: &'a [Transaction]) -> Result<&'a [Transaction]> {
        let have = self.len();
        if after > have {
            return Err(CoreError::OutOfOrderTransaction {
                session: self.session_id.clone(),
                expected: have,
                got: after,
            });
        }
        let overlap = (have - after) as usize;
        Ok(txs.get(overlap..).unwrap_or(&[]))
    }

    /// Verify that `signature` covers the log extended by `txs`, signed by
    /// any of `signers`.
    pub fn prepare(
        &self,
        txs: &[Transaction],
        signature: Signature,
        signers: &[SignerId],
    ) -> Result<PreparedAppend> {
        let (hasher, hash) = self.hash_with(txs)?;
        let verified = signers
            .iter()
            .any(|signer| signer.verify(hash.as_bytes(), &signature).is_ok());
        if !verified {
            return Err(CoreError::InvalidSignature(self.session_id.clone()));
        }
        Ok(PreparedAppend {
            size: txs.iter().map(Transaction::size_estimate).sum(),
            transactions: txs.to_vec(),
            hasher,
            signature,
        })
    }

    /// Append a prepared batch.
    pub fn commit(&mut self, prepared: PreparedAppend) -> AppendOutcome {
        let count = prepared.transactions.len();
        if count == 0 {
            return AppendOutcome::Duplicate;
        }
        self.transactions.extend(prepared.transactions);
        self.hasher = prepared.hasher;
        self.last_signature = Some(prepared.signature);
        self.bytes_since_checkpoint += prepared.size;
        if self.bytes_since_checkpoint > MAX_RECOMMENDED_TX_SIZE {
            self.signature_after.insert(self.len() - 1, prepared.signature);
            self.bytes_since_checkpoint = 0;
        }
        AppendOutcome::Appended { count }
    }

    /// Content from index `from` onwards, split at signature checkpoints so
    /// every segment carries a signature that verifies on its own.
    pub fn segments_since(&self, from: u32) -> Vec<SessionNewContent> {
        let mut segments = Vec::new();
        let Some(last_signature) = self.last_signature else {
            return segments;
        };
        let mut start = from;
        for (&idx, signature) in self.signature_after.range(from..) {
            let end = idx + 1;
            if end > start && end < self.len() {
                segments.push(self.segment(start, end, *signature));
                start = end;
            }
        }
        if start < self.len() {
            segments.push(self.segment(start, self.len(), last_signature));
        }
        segments
    }

    fn segment(&self, start: u32, end: u32, signature: Signature) -> SessionNewContent {
        SessionNewContent {
            after: start,
            new_transactions: self.transactions[start as usize..end as usize].to_vec(),
            last_signature: signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use crate::types::ActorId;
    use serde_json::json;

    fn setup() -> (AgentSecret, SessionLog) {
        let agent = AgentSecret::generate();
        let session = SessionId::new(ActorId::Agent(agent.id()), "a1");
        (agent, SessionLog::new(&co_id(), session))
    }

    fn co_id() -> RawCoId {
        RawCoId::from_bytes([1; 20])
    }

    /// An empty log of the same session, as a peer receiving it starts.
    fn replica_of(log: &SessionLog) -> SessionLog {
        SessionLog::new(&co_id(), log.session_id().clone())
    }

    fn tx(n: i64) -> Transaction {
        Transaction::trusting(n, &[json!({"op": "set", "key": "k", "value": n})]).unwrap()
    }

    fn append(log: &mut SessionLog, agent: &AgentSecret, txs: Vec<Transaction>) {
        let sig = log.sign_next(&txs, &agent.signer).unwrap();
        let prepared = log.prepare(&txs, sig, &[agent.signer.id()]).unwrap();
        log.commit(prepared);
    }

    #[test]
    fn test_append_and_verify() {
        let (agent, mut log) = setup();
        append(&mut log, &agent, vec![tx(1), tx(2)]);
        assert_eq!(log.len(), 2);
        assert!(log.last_signature().is_some());
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let (agent, log) = setup();
        let other = AgentSecret::generate();
        let txs = vec![tx(1)];
        let sig = log.sign_next(&txs, &agent.signer).unwrap();
        let err = log.prepare(&txs, sig, &[other.signer.id()]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSignature(_)));
    }

    #[test]
    fn test_signature_is_bound_to_the_session() {
        let (agent, mut log) = setup();
        append(&mut log, &agent, vec![tx(1)]);

        let other = SessionLog::new(&co_id(), SessionId::new(ActorId::Agent(agent.id()), "a2"));
        let sig = *log.last_signature().unwrap();
        assert!(other.prepare(log.transactions(), sig, &[agent.signer.id()]).is_err());
    }

    #[test]
    fn test_signature_binds_content() {
        let (agent, log) = setup();
        let sig = log.sign_next(&[tx(1)], &agent.signer).unwrap();
        assert!(log.prepare(&[tx(2)], sig, &[agent.signer.id()]).is_err());
    }

    #[test]
    fn test_overlap_and_gap() {
        let (agent, mut log) = setup();
        append(&mut log, &agent, vec![tx(1), tx(2)]);

        let offered = vec![tx(2), tx(3)];
        assert_eq!(log.new_suffix(1, &offered).unwrap(), &offered[1..]);
        assert!(log.new_suffix(0, &offered).unwrap().is_empty());

        let err = log.new_suffix(3, &offered).unwrap_err();
        assert!(matches!(
            err,
            CoreError::OutOfOrderTransaction {
                expected: 2,
                got: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_incremental_signature_matches_full() {
        let (agent, mut log) = setup();
        append(&mut log, &agent, vec![tx(1)]);
        append(&mut log, &agent, vec![tx(2)]);

        let mut fresh = replica_of(&log);
        let full_sig = *log.last_signature().unwrap();
        let prepared = fresh.prepare(log.transactions(), full_sig, &[agent.signer.id()]);
        assert!(prepared.is_ok());
        fresh.commit(prepared.unwrap());
        assert_eq!(fresh.len(), 2);
    }

    #[test]
    fn test_checkpoints_split_segments() {
        let (agent, mut log) = setup();
        let big = "x".repeat(60 * 1024);
        for i in 0..4 {
            let t = Transaction::trusting(i, &[json!({"op": "set", "key": "k", "value": big})])
                .unwrap();
            append(&mut log, &agent, vec![t]);
        }
        assert!(!log.signature_checkpoints().is_empty());

        let segments = log.segments_since(0);
        assert!(segments.len() >= 2);
        let total: usize = segments.iter().map(|s| s.new_transactions.len()).sum();
        assert_eq!(total, 4);
        let mut expected_after = 0;
        for segment in &segments {
            assert_eq!(segment.after, expected_after);
            expected_after += segment.new_transactions.len() as u32;
        }

        // Every segment verifies on a replica that has the previous ones.
        let mut replica = replica_of(&log);
        for segment in segments {
            let prepared = replica
                .prepare(&segment.new_transactions, segment.last_signature, &[agent.signer.id()])
                .unwrap();
            replica.commit(prepared);
        }
        assert_eq!(replica.len(), 4);
    }

    #[test]
    fn test_segments_since_skips_known() {
        let (agent, mut log) = setup();
        append(&mut log, &agent, vec![tx(1), tx(2), tx(3)]);
        let segments = log.segments_since(2);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].after, 2);
        assert_eq!(segments[0].new_transactions, vec![tx(3)]);
        assert!(log.segments_since(3).is_empty());
    }
}
