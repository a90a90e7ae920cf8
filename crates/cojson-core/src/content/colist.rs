//! CoList: replicated growable array.
//!
//! Every insertion names the element it goes after (or the start). Elements
//! form a tree by that reference; siblings are ordered newest first by
//! `(madeAt, sessionId, txIndex, changeIdx)` and the list is the pre-order
//! walk of the tree. Deletions tombstone an insertion and are idempotent.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::trace;

use crate::transaction::DecryptedTransaction;
use crate::types::{OpId, RawCoId, TransactionId};

/// Where an insertion is anchored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Anchor {
    Start,
    After(OpId),
}

impl Anchor {
    fn to_json(&self) -> Value {
        match self {
            Anchor::Start => json!("start"),
            Anchor::After(op) => json!(op),
        }
    }

    fn from_json(value: &Value) -> Option<Self> {
        if value.as_str() == Some("start") {
            return Some(Anchor::Start);
        }
        serde_json::from_value(value.clone()).ok().map(Anchor::After)
    }
}

/// A parsed list change.
#[derive(Debug, Clone)]
pub(crate) enum ListChange {
    App { value: Value, after: Anchor },
    Del { insertion: OpId },
}

impl ListChange {
    pub(crate) fn parse(change: &Value) -> Option<Self> {
        match change.get("op")?.as_str()? {
            "app" => Some(ListChange::App {
                value: change.get("value")?.clone(),
                after: Anchor::from_json(change.get("after")?)?,
            }),
            "del" => Some(ListChange::Del {
                insertion: serde_json::from_value(change.get("insertion")?.clone()).ok()?,
            }),
            _ => None,
        }
    }
}

/// One element in list order, deleted or not.
#[derive(Debug, Clone, PartialEq)]
pub struct ListElement {
    pub op_id: OpId,
    pub value: Value,
    pub deleted: bool,
}

struct Node {
    value: Value,
    children: Vec<OpId>,
}

/// Materialized list.
#[derive(Debug, Clone, PartialEq)]
pub struct CoList {
    id: RawCoId,
    /// All elements in list order, tombstones included.
    elements: Vec<ListElement>,
}

impl CoList {
    /// Project a list from valid, readable transactions in any order.
    pub fn from_transactions(id: RawCoId, txs: &[DecryptedTransaction]) -> Self {
        let mut changes = Vec::new();
        for tx in txs {
            for (change_idx, change) in tx.changes.iter().enumerate() {
                match ListChange::parse(change) {
                    Some(parsed) => {
                        changes.push((tx.made_at, OpId::new(&tx.tx_id, change_idx as u32), parsed))
                    }
                    None => trace!(co_value = %id, "skipping malformed list change"),
                }
            }
        }
        Self::from_changes(id, changes)
    }

    pub(crate) fn from_changes(id: RawCoId, changes: Vec<(i64, OpId, ListChange)>) -> Self {
        let mut nodes: HashMap<OpId, Node> = HashMap::new();
        let mut order: HashMap<OpId, (i64, OpId)> = HashMap::new();
        let mut anchors: Vec<(OpId, Anchor)> = Vec::new();
        let mut deleted: HashSet<OpId> = HashSet::new();

        for (made_at, op_id, change) in changes {
            match change {
                ListChange::App { value, after } => {
                    anchors.push((op_id.clone(), after));
                    order.insert(op_id.clone(), (made_at, op_id.clone()));
                    nodes.insert(
                        op_id,
                        Node {
                            value,
                            children: Vec::new(),
                        },
                    );
                }
                ListChange::Del { insertion } => {
                    deleted.insert(insertion);
                }
            }
        }

        let mut roots: Vec<OpId> = Vec::new();
        for (op_id, anchor) in anchors {
            match anchor {
                Anchor::Start => roots.push(op_id),
                Anchor::After(parent) => match nodes.get_mut(&parent) {
                    Some(node) if parent != op_id => node.children.push(op_id),
                    _ => trace!(co_value = %id, "dropping insertion with unknown anchor"),
                },
            }
        }

        let newest_first = |ids: &mut Vec<OpId>| ids.sort_by(|a, b| order[b].cmp(&order[a]));
        newest_first(&mut roots);
        for node in nodes.values_mut() {
            newest_first(&mut node.children);
        }

        // Iterative pre-order walk; children pushed in reverse so the newest
        // is visited first.
        let mut elements = Vec::with_capacity(nodes.len());
        let mut stack: Vec<OpId> = roots.into_iter().rev().collect();
        let mut visited: HashSet<OpId> = HashSet::new();
        while let Some(op_id) = stack.pop() {
            if !visited.insert(op_id.clone()) {
                continue;
            }
            let Some(node) = nodes.get(&op_id) else {
                continue;
            };
            stack.extend(node.children.iter().rev().cloned());
            elements.push(ListElement {
                deleted: deleted.contains(&op_id),
                value: node.value.clone(),
                op_id,
            });
        }

        Self { id, elements }
    }

    pub fn id(&self) -> &RawCoId {
        &self.id
    }

    /// Visible values in order.
    pub fn items(&self) -> Vec<&Value> {
        self.visible().map(|e| &e.value).collect()
    }

    /// Visible elements in order.
    pub fn visible(&self) -> impl Iterator<Item = &ListElement> {
        self.elements.iter().filter(|e| !e.deleted)
    }

    /// All elements in order, tombstones included.
    pub fn all_elements(&self) -> &[ListElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.visible().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.visible().nth(index).map(|e| &e.value)
    }

    /// Identity of the visible element at `index`.
    pub fn op_id_at(&self, index: usize) -> Option<&OpId> {
        self.visible().nth(index).map(|e| &e.op_id)
    }

    /// Identity of the last visible element.
    pub fn last_op_id(&self) -> Option<&OpId> {
        self.visible().last().map(|e| &e.op_id)
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.items().into_iter().cloned().collect())
    }

    /// Changes inserting `values` consecutively after `after`, for a
    /// transaction that will be written at `tx`.
    pub fn insert_ops(after: Option<&OpId>, values: Vec<Value>, tx: &TransactionId) -> Vec<Value> {
        let mut anchor = match after {
            Some(op) => Anchor::After(op.clone()),
            None => Anchor::Start,
        };
        let mut ops = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            ops.push(json!({"op": "app", "value": value, "after": anchor.to_json()}));
            anchor = Anchor::After(OpId::new(tx, i as u32));
        }
        ops
    }

    /// Change deleting the element created by `insertion`.
    pub fn delete_op(insertion: &OpId) -> Value {
        json!({"op": "del", "insertion": insertion})
    }
}
