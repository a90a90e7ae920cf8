//! In-memory implementation of the Store trait.
//!
//! Same semantics as SQLite without persistence. A unit of work runs
//! against a staged copy that replaces the live maps only on success.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cojson_core::{CoValueHeader, RawCoId, SessionId, Signature, Transaction};

use crate::error::{Result, StoreError};
use crate::traits::{SessionUpdate, Store, StoreWriter, StoredCoValue, StoredSession};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Debug, Clone, Default)]
struct MemoryStoreInner {
    next_row: i64,
    co_values: BTreeMap<RawCoId, StoredCoValue>,
    sessions: BTreeMap<i64, StoredSession>,
    transactions: BTreeMap<(i64, u32), Transaction>,
    signatures: BTreeMap<(i64, u32), Signature>,
}

impl MemoryStoreInner {
    fn next_row(&mut self) -> i64 {
        self.next_row += 1;
        self.next_row
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {e}")))
    }
}

impl StoreWriter for MemoryStoreInner {
    fn add_co_value(&mut self, id: &RawCoId, header: &CoValueHeader) -> Result<i64> {
        if let Some(existing) = self.co_values.get(id) {
            return Ok(existing.row_id);
        }
        let row_id = self.next_row();
        self.co_values.insert(
            *id,
            StoredCoValue {
                row_id,
                id: *id,
                header: header.clone(),
            },
        );
        Ok(row_id)
    }

    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<i64> {
        let existing = self
            .sessions
            .values()
            .find(|s| s.co_value == update.co_value && s.session_id == update.session_id)
            .map(|s| s.row_id);
        let row_id = match existing {
            Some(row_id) => row_id,
            None => self.next_row(),
        };
        self.sessions.insert(
            row_id,
            StoredSession {
                row_id,
                co_value: update.co_value,
                session_id: update.session_id.clone(),
                last_idx: update.last_idx,
                last_signature: update.last_signature,
                bytes_since_signature: update.bytes_since_signature,
            },
        );
        Ok(row_id)
    }

    fn add_transaction(&mut self, session_row: i64, idx: u32, tx: &Transaction) -> Result<()> {
        self.transactions.insert((session_row, idx), tx.clone());
        Ok(())
    }

    fn add_signature_after(&mut self, session_row: i64, idx: u32, signature: &Signature) -> Result<()> {
        self.signatures.insert((session_row, idx), *signature);
        Ok(())
    }

    fn get_co_value(&self, id: &RawCoId) -> Result<Option<StoredCoValue>> {
        Ok(self.co_values.get(id).cloned())
    }

    fn get_session(&self, co_value: i64, session_id: &SessionId) -> Result<Option<StoredSession>> {
        Ok(self
            .sessions
            .values()
            .find(|s| s.co_value == co_value && &s.session_id == session_id)
            .cloned())
    }
}

impl Store for MemoryStore {
    fn get_co_value(&self, id: &RawCoId) -> Result<Option<StoredCoValue>> {
        Ok(self.read()?.co_values.get(id).cloned())
    }

    fn get_co_value_sessions(&self, co_value: i64) -> Result<Vec<StoredSession>> {
        Ok(self
            .read()?
            .sessions
            .values()
            .filter(|s| s.co_value == co_value)
            .cloned()
            .collect())
    }

    fn get_new_transaction_in_session(&self, session_row: i64, from: u32) -> Result<Vec<Transaction>> {
        Ok(self
            .read()?
            .transactions
            .range((session_row, from)..=(session_row, u32::MAX))
            .map(|(_, tx)| tx.clone())
            .collect())
    }

    fn get_signatures(&self, session_row: i64, from: u32) -> Result<Vec<(u32, Signature)>> {
        Ok(self
            .read()?
            .signatures
            .range((session_row, from)..=(session_row, u32::MAX))
            .map(|(&(_, idx), signature)| (idx, *signature))
            .collect())
    }

    fn co_value_ids(&self) -> Result<Vec<RawCoId>> {
        Ok(self.read()?.co_values.keys().copied().collect())
    }

    fn unit_of_work<T>(&self, f: impl FnOnce(&mut dyn StoreWriter) -> Result<T>) -> Result<T> {
        let mut live = self.write()?;
        let mut staged = live.clone();
        let out = f(&mut staged)?;
        *live = staged;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{append_session, known_state};
    use cojson_core::{ActorId, CoValueType, Ruleset};
    use serde_json::json;

    fn header() -> CoValueHeader {
        CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, 0)
    }

    fn session() -> SessionId {
        SessionId::new(ActorId::Account(RawCoId::from_bytes([1; 20])), "a")
    }

    fn txs(n: usize) -> Vec<Transaction> {
        (0..n)
            .map(|i| Transaction::trusting(i as i64, &[json!({"op": "set", "key": "k", "value": i})]).unwrap())
            .collect()
    }

    #[test]
    fn test_append_and_read_back() {
        let store = MemoryStore::new();
        let header = header();
        let id = header.id().unwrap();
        let sig = Signature::from_bytes([7; 64]);

        store
            .unit_of_work(|w| {
                let row = w.add_co_value(&id, &header)?;
                assert!(append_session(w, row, &session(), 0, &txs(3), sig)?);
                Ok(())
            })
            .unwrap();

        let known = known_state(&store, &id).unwrap().unwrap();
        assert_eq!(known.count(&session()), 3);

        let co_value = store.get_co_value(&id).unwrap().unwrap();
        let sessions = store.get_co_value_sessions(co_value.row_id).unwrap();
        let tail = store
            .get_new_transaction_in_session(sessions[0].row_id, 1)
            .unwrap();
        assert_eq!(tail, txs(3)[1..].to_vec());
    }

    #[test]
    fn test_gap_is_refused_and_duplicates_skipped() {
        let store = MemoryStore::new();
        let header = header();
        let id = header.id().unwrap();
        let sig = Signature::from_bytes([7; 64]);

        let (gap, dup) = store
            .unit_of_work(|w| {
                let row = w.add_co_value(&id, &header)?;
                append_session(w, row, &session(), 0, &txs(2), sig)?;
                let gap = append_session(w, row, &session(), 5, &txs(1), sig)?;
                let dup = append_session(w, row, &session(), 0, &txs(2), sig)?;
                Ok((gap, dup))
            })
            .unwrap();
        assert!(!gap);
        assert!(dup);
        assert_eq!(known_state(&store, &id).unwrap().unwrap().count(&session()), 2);
    }

    #[test]
    fn test_failed_unit_of_work_leaves_nothing() {
        let store = MemoryStore::new();
        let header = header();
        let id = header.id().unwrap();

        let result: Result<()> = store.unit_of_work(|w| {
            w.add_co_value(&id, &header)?;
            Err(StoreError::InvalidData("abort".into()))
        });
        assert!(result.is_err());
        assert!(store.get_co_value(&id).unwrap().is_none());
    }
}
