//! CoStream: per-session append-only feeds, plus binary streams.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::trace;

use crate::transaction::DecryptedTransaction;
use crate::types::{RawCoId, SessionId, TransactionId};

/// One item of one session's feed.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem {
    pub value: Value,
    pub tx_id: TransactionId,
    pub made_at: i64,
}

/// Materialized stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CoStream {
    id: RawCoId,
    items: BTreeMap<SessionId, Vec<StreamItem>>,
}

impl CoStream {
    /// Every change of every transaction is one item of its session.
    pub fn from_transactions(id: RawCoId, txs: &[DecryptedTransaction]) -> Self {
        let mut ordered: Vec<&DecryptedTransaction> = txs.iter().collect();
        ordered.sort_by_key(|tx| tx.tx_id.tx_index);

        let mut items: BTreeMap<SessionId, Vec<StreamItem>> = BTreeMap::new();
        for tx in ordered {
            let feed = items.entry(tx.tx_id.session_id.clone()).or_default();
            for change in &tx.changes {
                feed.push(StreamItem {
                    value: change.clone(),
                    tx_id: tx.tx_id.clone(),
                    made_at: tx.made_at,
                });
            }
        }
        Self { id, items }
    }

    pub fn id(&self) -> &RawCoId {
        &self.id
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.items.keys()
    }

    /// Items of one session, oldest first.
    pub fn items(&self, session: &SessionId) -> &[StreamItem] {
        self.items.get(session).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The most recent item of every session.
    pub fn latest_per_session(&self) -> BTreeMap<&SessionId, &StreamItem> {
        self.items
            .iter()
            .filter_map(|(session, feed)| Some((session, feed.last()?)))
            .collect()
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (session, feed) in &self.items {
            map.insert(
                session.to_string(),
                Value::Array(feed.iter().map(|i| i.value.clone()).collect()),
            );
        }
        Value::Object(map)
    }

    /// Reassemble a binary stream, if the items form one.
    ///
    /// The first session (in causal order of its `start` item) carrying a
    /// `start` item is read; later sessions are ignored.
    pub fn binary(&self) -> Option<BinaryStream> {
        let feed = self
            .items
            .values()
            .filter(|feed| {
                feed.first().and_then(|i| i.value.get("type")).and_then(Value::as_str)
                    == Some("start")
            })
            .min_by_key(|feed| (feed[0].made_at, feed[0].tx_id.session_id.clone()))?;

        let start = &feed[0].value;
        let mut stream = BinaryStream {
            mime_type: start.get("mimeType")?.as_str()?.to_string(),
            file_name: start.get("fileName").and_then(Value::as_str).map(str::to_string),
            total_size_bytes: start.get("totalSizeBytes").and_then(Value::as_u64),
            data: Vec::new(),
            finished: false,
        };
        for item in &feed[1..] {
            match item.value.get("type").and_then(Value::as_str) {
                Some("chunk") => {
                    let decoded = item
                        .value
                        .get("chunk")
                        .and_then(Value::as_str)
                        .and_then(|hex_chunk| hex::decode(hex_chunk).ok());
                    match decoded {
                        Some(bytes) => stream.data.extend_from_slice(&bytes),
                        None => trace!(co_value = %self.id, "skipping malformed binary chunk"),
                    }
                }
                Some("end") => {
                    stream.finished = true;
                    break;
                }
                _ => trace!(co_value = %self.id, "skipping unexpected binary stream item"),
            }
        }
        Some(stream)
    }

    /// Items that encode `data` as a binary stream.
    pub fn binary_items(
        mime_type: &str,
        file_name: Option<&str>,
        data: &[u8],
        chunk_size: usize,
    ) -> Vec<Value> {
        let mut items = vec![json!({
            "type": "start",
            "mimeType": mime_type,
            "fileName": file_name,
            "totalSizeBytes": data.len(),
        })];
        for chunk in data.chunks(chunk_size.max(1)) {
            items.push(json!({"type": "chunk", "chunk": hex::encode(chunk)}));
        }
        items.push(json!({"type": "end"}));
        items
    }
}

/// A reassembled binary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryStream {
    pub mime_type: String,
    pub file_name: Option<String>,
    pub total_size_bytes: Option<u64>,
    pub data: Vec<u8>,
    pub finished: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActorId;

    fn session(name: &str) -> SessionId {
        SessionId::new(ActorId::Account(RawCoId::from_bytes([1; 20])), name)
    }

    fn tx(session_name: &str, index: u32, made_at: i64, changes: Vec<Value>) -> DecryptedTransaction {
        let session_id = session(session_name);
        DecryptedTransaction {
            tx_id: TransactionId::new(session_id.clone(), index),
            author: *session_id.actor(),
            made_at,
            changes,
        }
    }

    #[test]
    fn test_latest_per_session() {
        let id = RawCoId::from_bytes([4; 20]);
        let stream = CoStream::from_transactions(
            id,
            &[
                tx("a", 1, 5, vec![json!("a2")]),
                tx("a", 0, 1, vec![json!("a1")]),
                tx("b", 0, 3, vec![json!("b1")]),
            ],
        );
        let latest = stream.latest_per_session();
        assert_eq!(latest[&session("a")].value, json!("a2"));
        assert_eq!(latest[&session("b")].value, json!("b1"));
        assert_eq!(stream.items(&session("a")).len(), 2);
    }

    #[test]
    fn test_binary_reassembly() {
        let id = RawCoId::from_bytes([4; 20]);
        let data: Vec<u8> = (0..=255).collect();
        let items = CoStream::binary_items("application/octet-stream", Some("f.bin"), &data, 100);
        assert_eq!(items.len(), 5);

        let stream = CoStream::from_transactions(id, &[tx("a", 0, 1, items)]);
        let binary = stream.binary().unwrap();
        assert!(binary.finished);
        assert_eq!(binary.data, data);
        assert_eq!(binary.total_size_bytes, Some(256));
        assert_eq!(binary.file_name.as_deref(), Some("f.bin"));
    }

    #[test]
    fn test_unfinished_binary() {
        let id = RawCoId::from_bytes([4; 20]);
        let mut items = CoStream::binary_items("text/plain", None, b"hello", 2);
        items.pop();
        let stream = CoStream::from_transactions(id, &[tx("a", 0, 1, items)]);
        let binary = stream.binary().unwrap();
        assert!(!binary.finished);
        assert_eq!(binary.data, b"hello");
    }
}
