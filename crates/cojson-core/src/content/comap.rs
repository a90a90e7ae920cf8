//! CoMap: last-writer-wins map.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::trace;

use crate::transaction::DecryptedTransaction;
use crate::types::{RawCoId, TransactionId};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum MapChange {
    Set { key: String, value: Value },
    Del { key: String },
}

/// One edit of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEdit {
    /// `None` for deletions.
    pub value: Option<Value>,
    pub tx_id: TransactionId,
    pub made_at: i64,
    pub change_idx: u32,
}

/// Materialized map. Per key, the edit last in `(madeAt, sessionId,
/// txIndex, changeIdx)` order wins, independent of delivery order.
#[derive(Debug, Clone, PartialEq)]
pub struct CoMap {
    id: RawCoId,
    edits: BTreeMap<String, Vec<MapEdit>>,
}

impl CoMap {
    /// Project a map from valid, readable transactions in any order.
    pub fn from_transactions(id: RawCoId, txs: &[DecryptedTransaction]) -> Self {
        let mut ordered: Vec<&DecryptedTransaction> = txs.iter().collect();
        ordered.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

        let mut edits: BTreeMap<String, Vec<MapEdit>> = BTreeMap::new();
        for tx in ordered {
            for (change_idx, change) in tx.changes.iter().enumerate() {
                let parsed = match MapChange::deserialize(change) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        trace!(co_value = %id, error = %e, "skipping malformed map change");
                        continue;
                    }
                };
                let (key, value) = match parsed {
                    MapChange::Set { key, value } => (key, Some(value)),
                    MapChange::Del { key } => (key, None),
                };
                edits.entry(key).or_default().push(MapEdit {
                    value,
                    tx_id: tx.tx_id.clone(),
                    made_at: tx.made_at,
                    change_idx: change_idx as u32,
                });
            }
        }
        Self { id, edits }
    }

    pub fn id(&self) -> &RawCoId {
        &self.id
    }

    /// The winning edit for `key`, deletions included.
    pub fn latest(&self, key: &str) -> Option<&MapEdit> {
        self.edits.get(key)?.last()
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.latest(key)?.value.as_ref()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// All edits of `key`, oldest first.
    pub fn history(&self, key: &str) -> &[MapEdit] {
        self.edits.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keys with a live value.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.edits
            .iter()
            .filter(|(_, edits)| edits.last().map(|e| e.value.is_some()).unwrap_or(false))
            .map(|(k, _)| k.as_str())
    }

    /// Live entries.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.edits
            .iter()
            .filter_map(|(k, edits)| Some((k.as_str(), edits.last()?.value.as_ref()?)))
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (k, v) in self.entries() {
            map.insert(k.to_string(), v.clone());
        }
        Value::Object(map)
    }

    /// Change that sets `key` to `value`.
    pub fn set_op(key: &str, value: Value) -> Value {
        json!({"op": "set", "key": key, "value": value})
    }

    /// Change that deletes `key`.
    pub fn del_op(key: &str) -> Value {
        json!({"op": "del", "key": key})
    }
}
