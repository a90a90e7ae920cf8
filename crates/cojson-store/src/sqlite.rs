//! SQLite implementation of the Store trait.
//!
//! This is the durable storage backend. It uses rusqlite with bundled
//! SQLite. Ids, session ids and signatures are stored in their text form,
//! headers and transactions as JSON.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use cojson_core::{CoValueHeader, RawCoId, SessionId, Signature, Transaction};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{SessionUpdate, Store, StoreWriter, StoredCoValue, StoredSession};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. Calls block; the storage peer runs
/// them on `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))
    }
}

fn parse<T>(column: &str, text: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    text.parse()
        .map_err(|e| StoreError::InvalidData(format!("{column}: {e}")))
}

fn co_value_row(conn: &Connection, id: &RawCoId) -> Result<Option<StoredCoValue>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT rowID, header FROM coValues WHERE id = ?1",
            params![id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(row_id, header)| {
        Ok(StoredCoValue {
            row_id,
            id: *id,
            header: serde_json::from_str(&header)?,
        })
    })
    .transpose()
}

type SessionRow = (i64, i64, String, u32, String, i64);

fn session_from_row(row: SessionRow) -> Result<StoredSession> {
    let (row_id, co_value, session_id, last_idx, last_signature, bytes) = row;
    Ok(StoredSession {
        row_id,
        co_value,
        session_id: parse("sessionID", &session_id)?,
        last_idx,
        last_signature: parse("lastSignature", &last_signature)?,
        bytes_since_signature: bytes.max(0) as u64,
    })
}

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

const SESSION_COLUMNS: &str =
    "rowID, coValue, sessionID, lastIdx, lastSignature, bytesSinceSignature";

/// Writes inside one SQLite transaction.
struct SqliteWriter<'c> {
    conn: &'c Connection,
}

impl StoreWriter for SqliteWriter<'_> {
    fn add_co_value(&mut self, id: &RawCoId, header: &CoValueHeader) -> Result<i64> {
        self.conn.execute(
            "INSERT OR IGNORE INTO coValues (id, header) VALUES (?1, ?2)",
            params![id.to_string(), serde_json::to_string(header)?],
        )?;
        let row_id = self.conn.query_row(
            "SELECT rowID FROM coValues WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(row_id)
    }

    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<i64> {
        let row_id = self.conn.query_row(
            "INSERT INTO sessions (coValue, sessionID, lastIdx, lastSignature, bytesSinceSignature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (coValue, sessionID) DO UPDATE SET
                lastIdx = excluded.lastIdx,
                lastSignature = excluded.lastSignature,
                bytesSinceSignature = excluded.bytesSinceSignature
             RETURNING rowID",
            params![
                update.co_value,
                update.session_id.as_str(),
                update.last_idx,
                update.last_signature.to_string(),
                update.bytes_since_signature as i64,
            ],
            |row| row.get(0),
        )?;
        Ok(row_id)
    }

    fn add_transaction(&mut self, session_row: i64, idx: u32, tx: &Transaction) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)",
            params![session_row, idx, serde_json::to_string(tx)?],
        )?;
        Ok(())
    }

    fn add_signature_after(&mut self, session_row: i64, idx: u32, signature: &Signature) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO signatureAfter (ses, idx, signature) VALUES (?1, ?2, ?3)",
            params![session_row, idx, signature.to_string()],
        )?;
        Ok(())
    }

    fn get_co_value(&self, id: &RawCoId) -> Result<Option<StoredCoValue>> {
        co_value_row(self.conn, id)
    }

    fn get_session(&self, co_value: i64, session_id: &SessionId) -> Result<Option<StoredSession>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE coValue = ?1 AND sessionID = ?2"),
                params![co_value, session_id.as_str()],
                read_session_row,
            )
            .optional()?;
        row.map(session_from_row).transpose()
    }
}

impl Store for SqliteStore {
    fn get_co_value(&self, id: &RawCoId) -> Result<Option<StoredCoValue>> {
        let conn = self.lock()?;
        co_value_row(&conn, id)
    }

    fn get_co_value_sessions(&self, co_value: i64) -> Result<Vec<StoredSession>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE coValue = ?1 ORDER BY sessionID"
        ))?;
        let rows = stmt
            .query_map(params![co_value], read_session_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(session_from_row).collect()
    }

    fn get_new_transaction_in_session(&self, session_row: i64, from: u32) -> Result<Vec<Transaction>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT tx FROM transactions WHERE ses = ?1 AND idx >= ?2 ORDER BY idx")?;
        let rows = stmt
            .query_map(params![session_row, from], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|tx| serde_json::from_str(tx).map_err(StoreError::from))
            .collect()
    }

    fn get_signatures(&self, session_row: i64, from: u32) -> Result<Vec<(u32, Signature)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT idx, signature FROM signatureAfter WHERE ses = ?1 AND idx >= ?2 ORDER BY idx",
        )?;
        let rows = stmt
            .query_map(params![session_row, from], |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(idx, signature)| Ok((idx, parse("signature", &signature)?)))
            .collect()
    }

    fn co_value_ids(&self) -> Result<Vec<RawCoId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM coValues ORDER BY rowID")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter().map(|id| parse("id", id)).collect()
    }

    fn unit_of_work<T>(&self, f: impl FnOnce(&mut dyn StoreWriter) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&mut SqliteWriter { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{append_session, dependencies, known_state};
    use cojson_core::{ActorId, CoValueType, Ruleset, MAX_RECOMMENDED_TX_SIZE};
    use serde_json::json;

    fn group_header() -> CoValueHeader {
        CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::Group {
                initial_admin: ActorId::Account(account()),
            },
            0,
        )
    }

    fn account() -> RawCoId {
        RawCoId::from_bytes([9; 20])
    }

    fn session() -> SessionId {
        SessionId::new(ActorId::Account(account()), "s1")
    }

    fn tx(payload: usize) -> Transaction {
        Transaction::trusting(1, &[json!({"op": "set", "key": "k", "value": "x".repeat(payload)})])
            .unwrap()
    }

    #[test]
    fn test_round_trip_through_sqlite() {
        let store = SqliteStore::open_memory().unwrap();
        let header = group_header();
        let id = header.id().unwrap();
        let sig = Signature::from_bytes([3; 64]);

        store
            .unit_of_work(|w| {
                let row = w.add_co_value(&id, &header)?;
                append_session(w, row, &session(), 0, &[tx(4), tx(5)], sig)?;
                Ok(())
            })
            .unwrap();

        let stored = store.get_co_value(&id).unwrap().unwrap();
        assert_eq!(stored.header, header);
        assert_eq!(store.co_value_ids().unwrap(), vec![id]);

        let sessions = store.get_co_value_sessions(stored.row_id).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, session());
        assert_eq!(sessions[0].last_signature, sig);
        assert_eq!(
            store.get_new_transaction_in_session(sessions[0].row_id, 0).unwrap(),
            vec![tx(4), tx(5)]
        );
    }

    #[test]
    fn test_rolled_back_unit_of_work() {
        let store = SqliteStore::open_memory().unwrap();
        let header = group_header();
        let id = header.id().unwrap();

        let result: Result<()> = store.unit_of_work(|w| {
            w.add_co_value(&id, &header)?;
            Err(StoreError::InvalidData("abort".into()))
        });
        assert!(result.is_err());
        assert!(known_state(&store, &id).unwrap().is_none());
    }

    #[test]
    fn test_checkpoint_after_large_session() {
        let store = SqliteStore::open_memory().unwrap();
        let header = group_header();
        let id = header.id().unwrap();
        let first = Signature::from_bytes([1; 64]);
        let second = Signature::from_bytes([2; 64]);

        store
            .unit_of_work(|w| {
                let row = w.add_co_value(&id, &header)?;
                append_session(w, row, &session(), 0, &[tx(MAX_RECOMMENDED_TX_SIZE - 1000)], first)?;
                append_session(w, row, &session(), 1, &[tx(2000)], second)?;
                Ok(())
            })
            .unwrap();

        let row = store.get_co_value(&id).unwrap().unwrap().row_id;
        let session_row = store.get_co_value_sessions(row).unwrap()[0].row_id;
        assert_eq!(store.get_signatures(session_row, 0).unwrap(), vec![(0, first)]);
    }

    #[test]
    fn test_dependencies_list_owner_and_authors() {
        let store = SqliteStore::open_memory().unwrap();
        let group = group_header();
        let group_id = group.id().unwrap();
        let map = CoValueHeader::new(CoValueType::CoMap, Ruleset::OwnedByGroup { group: group_id }, 0);
        let map_id = map.id().unwrap();
        let sig = Signature::from_bytes([3; 64]);

        store
            .unit_of_work(|w| {
                w.add_co_value(&group_id, &group)?;
                let row = w.add_co_value(&map_id, &map)?;
                append_session(w, row, &session(), 0, &[tx(1)], sig)?;
                Ok(())
            })
            .unwrap();

        // The account is not stored; it is still named.
        assert_eq!(dependencies(&store, &map_id).unwrap(), vec![group_id, account()]);
    }

    #[test]
    fn test_reopen_file_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let header = group_header();
        let id = header.id().unwrap();

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .unit_of_work(|w| w.add_co_value(&id, &header).map(|_| ()))
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_co_value(&id).unwrap().is_some());
    }
}
