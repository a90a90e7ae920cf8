//! Canonical JSON encoding.
//!
//! Hashes and signatures in cojson cover JSON text, so every replica must
//! produce byte-identical text for the same value. The rules:
//!
//! 1. Object keys are sorted by their UTF-8 bytes, recursively
//! 2. No insignificant whitespace
//! 3. Numbers and strings are rendered by `serde_json`
//!
//! Serializing a value, re-reading it and canonicalizing again is a no-op.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Rewrite a JSON value so that every object has sorted keys.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Canonical JSON text of any serializable value.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&canonicalize(value))?)
}

/// Canonical JSON bytes of any serializable value.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    canonical_json(value).map(String::into_bytes)
}
