//! CoPlainText: a list of characters plus range marks.
//!
//! Characters are list elements holding one-character strings, so concurrent
//! edits merge exactly like [`CoList`]. Marks name their first and last
//! character by insertion id and are resolved against the current text; a
//! deleted end moves to the nearest surviving character inside the range.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::ops::Range;
use tracing::trace;

use super::colist::{CoList, ListChange};
use crate::transaction::DecryptedTransaction;
use crate::types::{OpId, RawCoId, TransactionId};

#[derive(Debug, Clone)]
struct RawMark {
    start: OpId,
    end: OpId,
    tag: String,
    attrs: Value,
    made_at: i64,
    op_id: OpId,
}

impl RawMark {
    fn parse(change: &Value, made_at: i64, op_id: OpId) -> Option<Self> {
        if change.get("op")?.as_str()? != "mark" {
            return None;
        }
        Some(Self {
            start: serde_json::from_value(change.get("start")?.clone()).ok()?,
            end: serde_json::from_value(change.get("end")?.clone()).ok()?,
            tag: change.get("tag")?.as_str()?.to_string(),
            attrs: change.get("attrs").cloned().unwrap_or(Value::Null),
            made_at,
            op_id,
        })
    }
}

/// A mark resolved to visible character positions.
#[derive(Debug, Clone, PartialEq)]
pub struct Mark {
    pub tag: String,
    pub attrs: Value,
    /// Half-open range of character indices.
    pub range: Range<usize>,
}

/// Materialized text.
#[derive(Debug, Clone, PartialEq)]
pub struct CoPlainText {
    chars: CoList,
    marks: Vec<Mark>,
}

impl CoPlainText {
    pub fn from_transactions(id: RawCoId, txs: &[DecryptedTransaction]) -> Self {
        let mut changes = Vec::new();
        let mut raw_marks = Vec::new();
        for tx in txs {
            for (change_idx, change) in tx.changes.iter().enumerate() {
                let op_id = OpId::new(&tx.tx_id, change_idx as u32);
                if let Some(mark) = RawMark::parse(change, tx.made_at, op_id.clone()) {
                    raw_marks.push(mark);
                    continue;
                }
                match ListChange::parse(change) {
                    Some(parsed) => changes.push((tx.made_at, op_id, parsed)),
                    None => trace!(co_value = %id, "skipping malformed text change"),
                }
            }
        }

        let chars = CoList::from_changes(id, changes);
        raw_marks.sort_by(|a, b| (a.made_at, &a.op_id).cmp(&(b.made_at, &b.op_id)));
        let marks = resolve_marks(&chars, raw_marks);
        Self { chars, marks }
    }

    pub fn id(&self) -> &RawCoId {
        self.chars.id()
    }

    /// Current text.
    pub fn text(&self) -> String {
        self.chars.items().into_iter().filter_map(Value::as_str).collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Marks in the order they were made.
    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    /// Identity of the character at `index`.
    pub fn op_id_at(&self, index: usize) -> Option<&OpId> {
        self.chars.op_id_at(index)
    }

    pub fn to_json(&self) -> Value {
        Value::String(self.text())
    }

    /// Changes inserting `text` after the character at `after`.
    pub fn insert_ops(after: Option<&OpId>, text: &str, tx: &TransactionId) -> Vec<Value> {
        let chars = text.chars().map(|c| Value::String(c.to_string())).collect();
        CoList::insert_ops(after, chars, tx)
    }

    /// Changes deleting the characters in `range`.
    pub fn delete_ops(&self, range: Range<usize>) -> Vec<Value> {
        range
            .filter_map(|i| self.chars.op_id_at(i))
            .map(CoList::delete_op)
            .collect()
    }

    /// Change marking the characters in `range` with `tag`. `None` for an
    /// empty or out-of-bounds range.
    pub fn mark_op(&self, range: Range<usize>, tag: &str, attrs: Value) -> Option<Value> {
        if range.is_empty() {
            return None;
        }
        let start = self.chars.op_id_at(range.start)?;
        let end = self.chars.op_id_at(range.end - 1)?;
        Some(json!({"op": "mark", "start": start, "end": end, "tag": tag, "attrs": attrs}))
    }
}

fn resolve_marks(chars: &CoList, raw_marks: Vec<RawMark>) -> Vec<Mark> {
    // Position of every element, tombstones included, plus the visible index
    // of the first visible element at or after each position.
    let elements = chars.all_elements();
    let position: HashMap<&OpId, usize> =
        elements.iter().enumerate().map(|(i, e)| (&e.op_id, i)).collect();
    let mut visible_before = Vec::with_capacity(elements.len() + 1);
    let mut count = 0usize;
    for element in elements {
        visible_before.push(count);
        if !element.deleted {
            count += 1;
        }
    }
    visible_before.push(count);

    raw_marks
        .into_iter()
        .filter_map(|mark| {
            let (Some(&start), Some(&end)) = (position.get(&mark.start), position.get(&mark.end))
            else {
                trace!(tag = %mark.tag, "dropping mark with unknown anchor");
                return None;
            };
            // A deleted start moves right, a deleted end moves left.
            let from = visible_before[start];
            let to = visible_before[end + 1];
            (from < to).then(|| Mark {
                tag: mark.tag,
                attrs: mark.attrs,
                range: from..to,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorId, SessionId};

    fn session(name: &str) -> SessionId {
        SessionId::new(ActorId::Account(RawCoId::from_bytes([1; 20])), name)
    }

    fn tx_id(name: &str, index: u32) -> TransactionId {
        TransactionId::new(session(name), index)
    }

    fn tx(session_name: &str, index: u32, made_at: i64, changes: Vec<Value>) -> DecryptedTransaction {
        let tx_id = tx_id(session_name, index);
        DecryptedTransaction {
            author: *tx_id.session_id.actor(),
            tx_id,
            made_at,
            changes,
        }
    }

    fn id() -> RawCoId {
        RawCoId::from_bytes([6; 20])
    }

    #[test]
    fn test_text_and_insert() {
        let base = tx("s", 0, 1, CoPlainText::insert_ops(None, "helo", &tx_id("s", 0)));
        let text = CoPlainText::from_transactions(id(), &[base.clone()]);
        assert_eq!(text.text(), "helo");

        let after_l = text.op_id_at(2).cloned();
        let fix = tx("s", 1, 2, CoPlainText::insert_ops(after_l.as_ref(), "l", &tx_id("s", 1)));
        let text = CoPlainText::from_transactions(id(), &[base, fix]);
        assert_eq!(text.text(), "hello");
        assert_eq!(text.len(), 5);
    }

    #[test]
    fn test_mark_survives_concurrent_edits() {
        let base = tx("s", 0, 1, CoPlainText::insert_ops(None, "hello world", &tx_id("s", 0)));
        let text = CoPlainText::from_transactions(id(), &[base.clone()]);
        let bold = tx("s", 1, 2, vec![text.mark_op(6..11, "bold", json!({})).unwrap()]);

        // Another session prepends while the mark is made.
        let prefix = tx("t", 0, 2, CoPlainText::insert_ops(None, ">> ", &tx_id("t", 0)));

        let text = CoPlainText::from_transactions(id(), &[base, bold, prefix]);
        assert_eq!(text.text(), ">> hello world");
        assert_eq!(text.marks().len(), 1);
        assert_eq!(text.marks()[0].range, 9..14);
        assert_eq!(&text.text()[9..14], "world");
    }

    #[test]
    fn test_deleted_mark_ends_move_inward() {
        let base = tx("s", 0, 1, CoPlainText::insert_ops(None, "abcdef", &tx_id("s", 0)));
        let text = CoPlainText::from_transactions(id(), &[base.clone()]);
        let mark = tx("s", 1, 2, vec![text.mark_op(1..5, "em", json!({"x": 1})).unwrap()]);
        let mut deletes = text.delete_ops(1..2);
        deletes.extend(text.delete_ops(4..5));
        let del = tx("s", 2, 3, deletes);

        let text = CoPlainText::from_transactions(id(), &[base.clone(), mark.clone(), del]);
        assert_eq!(text.text(), "acdf");
        assert_eq!(text.marks()[0].range, 1..3);
        assert_eq!(text.marks()[0].attrs, json!({"x": 1}));

        let all = CoPlainText::from_transactions(id(), &[base, mark, tx("s", 2, 3, text_delete_all())]);
        assert!(all.marks().is_empty());
    }

    fn text_delete_all() -> Vec<Value> {
        let base = tx("s", 0, 1, CoPlainText::insert_ops(None, "abcdef", &tx_id("s", 0)));
        CoPlainText::from_transactions(id(), &[base]).delete_ops(0..6)
    }
}
