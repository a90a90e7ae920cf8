//! Store trait: the abstract interface for CoValue persistence.
//!
//! Rows are keyed the way the sync protocol addresses content: a CoValue
//! row per header, a session row per `(coValue, sessionID)`, and a
//! transaction row per `(session, txIndex)`. Signature checkpoints
//! (`signatureAfter`) let stored sessions be sent in chunks that each
//! verify on their own.

use std::collections::HashSet;

use cojson_core::{
    CoValueHeader, CoValueKnownState, RawCoId, SessionId, Signature, Transaction,
    MAX_RECOMMENDED_TX_SIZE,
};

use crate::error::Result;

/// A stored CoValue header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCoValue {
    pub row_id: i64,
    pub id: RawCoId,
    pub header: CoValueHeader,
}

/// A stored session of one CoValue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub row_id: i64,
    pub co_value: i64,
    pub session_id: SessionId,
    /// Number of stored transactions.
    pub last_idx: u32,
    pub last_signature: Signature,
    /// Bytes stored since the last checkpoint.
    pub bytes_since_signature: u64,
}

/// New head of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub co_value: i64,
    pub session_id: SessionId,
    pub last_idx: u32,
    pub last_signature: Signature,
    pub bytes_since_signature: u64,
}

/// Writes available inside [`Store::unit_of_work`].
pub trait StoreWriter {
    /// Insert a header; returns the row id. Inserting again returns the
    /// existing row.
    fn add_co_value(&mut self, id: &RawCoId, header: &CoValueHeader) -> Result<i64>;

    /// Create or move a session head; returns the session row id.
    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<i64>;

    fn add_transaction(&mut self, session_row: i64, idx: u32, tx: &Transaction) -> Result<()>;

    /// Record that `signature` covers the session up to and including `idx`.
    fn add_signature_after(&mut self, session_row: i64, idx: u32, signature: &Signature) -> Result<()>;

    fn get_co_value(&self, id: &RawCoId) -> Result<Option<StoredCoValue>>;

    fn get_session(&self, co_value: i64, session_id: &SessionId) -> Result<Option<StoredSession>>;
}

/// Persistence for CoValues.
///
/// Calls block; async callers wrap them in `spawn_blocking`.
pub trait Store: Send + Sync {
    fn get_co_value(&self, id: &RawCoId) -> Result<Option<StoredCoValue>>;

    fn get_co_value_sessions(&self, co_value: i64) -> Result<Vec<StoredSession>>;

    /// Transactions of a session from index `from` on, in order.
    fn get_new_transaction_in_session(&self, session_row: i64, from: u32) -> Result<Vec<Transaction>>;

    /// Signature checkpoints at or after `from`, in order.
    fn get_signatures(&self, session_row: i64, from: u32) -> Result<Vec<(u32, Signature)>>;

    /// Ids of every stored CoValue.
    fn co_value_ids(&self) -> Result<Vec<RawCoId>>;

    /// Run `f` atomically: either all of its writes land or none do.
    fn unit_of_work<T>(&self, f: impl FnOnce(&mut dyn StoreWriter) -> Result<T>) -> Result<T>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers shared by the backends and the storage peer
// ─────────────────────────────────────────────────────────────────────────────

/// What the store has of `id`.
pub fn known_state<S: Store + ?Sized>(store: &S, id: &RawCoId) -> Result<Option<CoValueKnownState>> {
    let Some(co_value) = store.get_co_value(id)? else {
        return Ok(None);
    };
    let mut known = CoValueKnownState::empty(*id);
    known.header = true;
    for session in store.get_co_value_sessions(co_value.row_id)? {
        known.sessions.insert(session.session_id, session.last_idx);
    }
    Ok(Some(known))
}

/// CoValues a receiver needs before it can check `header` and the sessions
/// of `co_value`: the owning group and authoring accounts, transitively,
/// dependencies of dependencies first.
pub fn dependencies<S: Store + ?Sized>(store: &S, id: &RawCoId) -> Result<Vec<RawCoId>> {
    let mut ordered = Vec::new();
    let mut visited = HashSet::new();
    visited.insert(*id);
    collect_dependencies(store, id, &mut visited, &mut ordered)?;
    Ok(ordered)
}

fn collect_dependencies<S: Store + ?Sized>(
    store: &S,
    id: &RawCoId,
    visited: &mut HashSet<RawCoId>,
    ordered: &mut Vec<RawCoId>,
) -> Result<()> {
    let Some(co_value) = store.get_co_value(id)? else {
        return Ok(());
    };
    let mut direct: Vec<RawCoId> = co_value.header.owner().copied().into_iter().collect();
    for session in store.get_co_value_sessions(co_value.row_id)? {
        if let Some(account) = session.session_id.actor().as_account() {
            direct.push(*account);
        }
    }
    for dependency in direct {
        if visited.insert(dependency) {
            collect_dependencies(store, &dependency, visited, ordered)?;
            ordered.push(dependency);
        }
    }
    Ok(())
}

/// Append `txs` (starting at `after`) to a session inside a unit of work.
///
/// Returns `Ok(false)` if they would leave a gap. Transactions the store
/// already has are skipped. The previous head signature becomes a
/// checkpoint once enough bytes accumulated after it.
pub fn append_session(
    writer: &mut dyn StoreWriter,
    co_value: i64,
    session_id: &SessionId,
    after: u32,
    txs: &[Transaction],
    last_signature: Signature,
) -> Result<bool> {
    let existing = writer.get_session(co_value, session_id)?;
    let have = existing.as_ref().map(|s| s.last_idx).unwrap_or(0);
    if after > have {
        return Ok(false);
    }
    let skip = (have - after) as usize;
    let Some(new) = txs.get(skip..).filter(|new| !new.is_empty()) else {
        return Ok(true);
    };

    let new_bytes: u64 = new.iter().map(|tx| tx.size_estimate() as u64).sum();
    let mut bytes_since_signature = existing
        .as_ref()
        .map(|s| s.bytes_since_signature)
        .unwrap_or(0);
    let checkpoint = match &existing {
        Some(session)
            if session.last_idx > 0
                && bytes_since_signature + new_bytes > MAX_RECOMMENDED_TX_SIZE as u64 =>
        {
            bytes_since_signature = 0;
            Some((session.last_idx - 1, session.last_signature))
        }
        _ => None,
    };

    let session_row = writer.add_session_update(&SessionUpdate {
        co_value,
        session_id: session_id.clone(),
        last_idx: have + new.len() as u32,
        last_signature,
        bytes_since_signature: bytes_since_signature + new_bytes,
    })?;
    if let Some((idx, signature)) = checkpoint {
        writer.add_signature_after(session_row, idx, &signature)?;
    }
    for (offset, tx) in new.iter().enumerate() {
        writer.add_transaction(session_row, have + offset as u32, tx)?;
    }
    Ok(true)
}
