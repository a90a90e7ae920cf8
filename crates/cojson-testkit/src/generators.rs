//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Value};

use cojson::{LocalNode, RawCoId, Result};

/// Generate a random RawCoId.
pub fn co_id() -> impl Strategy<Value = RawCoId> {
    any::<[u8; 20]>().prop_map(RawCoId::from_bytes)
}

/// A small JSON scalar.
pub fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

/// Keys drawn from a small set so edits collide.
pub fn map_key() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_string)
}

/// One edit to a map.
#[derive(Debug, Clone)]
pub enum MapEdit {
    Set(String, Value),
    Delete(String),
}

impl MapEdit {
    pub fn apply(&self, node: &mut LocalNode, map: &RawCoId) -> Result<()> {
        match self {
            MapEdit::Set(key, value) => node.set(map, key, value.clone()).map(|_| ()),
            MapEdit::Delete(key) => node.delete(map, key).map(|_| ()),
        }
    }
}

pub fn map_edit() -> impl Strategy<Value = MapEdit> {
    prop_oneof![
        3 => (map_key(), scalar()).prop_map(|(k, v)| MapEdit::Set(k, v)),
        1 => map_key().prop_map(MapEdit::Delete),
    ]
}

/// A sequence of map edits, each with how far the clock moves before it.
pub fn map_edits(max_len: usize) -> impl Strategy<Value = Vec<(i64, MapEdit)>> {
    prop::collection::vec((0i64..5, map_edit()), 0..=max_len)
}

/// One edit to a list, by position relative to the current length.
#[derive(Debug, Clone)]
pub enum ListEdit {
    /// Insert at `index % (len + 1)`.
    Insert(usize, Value),
    /// Remove at `index % len`, if not empty.
    Remove(usize),
}

impl ListEdit {
    pub fn apply(&self, node: &mut LocalNode, list: &RawCoId) -> Result<()> {
        let len = node
            .content(list)?
            .as_list()
            .map(|l| l.len())
            .unwrap_or_default();
        match self {
            ListEdit::Insert(index, value) => {
                node.insert(list, index % (len + 1), value.clone()).map(|_| ())
            }
            ListEdit::Remove(index) if len > 0 => node.remove(list, index % len).map(|_| ()),
            ListEdit::Remove(_) => Ok(()),
        }
    }
}

pub fn list_edit() -> impl Strategy<Value = ListEdit> {
    prop_oneof![
        3 => (any::<usize>(), scalar()).prop_map(|(i, v)| ListEdit::Insert(i, v)),
        1 => any::<usize>().prop_map(ListEdit::Remove),
    ]
}

pub fn list_edits(max_len: usize) -> impl Strategy<Value = Vec<ListEdit>> {
    prop::collection::vec(list_edit(), 0..=max_len)
}

/// Payload bytes of at most `max_len`.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn co_ids_display_and_parse(id in co_id()) {
            let parsed: RawCoId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }

        #[test]
        fn map_keys_are_from_the_small_set(key in map_key()) {
            prop_assert!(["a", "b", "c", "d"].contains(&key.as_str()));
        }
    }
}
