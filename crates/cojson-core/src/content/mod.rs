//! Typed views over a CoValue's transactions.
//!
//! A projection holds no state of its own: it is recomputed from the
//! decrypted transactions whenever it is needed, and its type is fixed by
//! the header.

pub mod colist;
pub mod comap;
pub mod coplaintext;
pub mod costream;

pub use colist::{Anchor, CoList, ListElement};
pub use comap::{CoMap, MapEdit};
pub use coplaintext::{CoPlainText, Mark};
pub use costream::{BinaryStream, CoStream, StreamItem};

use serde_json::Value;

use crate::header::{CoValueHeader, CoValueType};
use crate::transaction::DecryptedTransaction;
use crate::types::RawCoId;

/// Projection of one CoValue, selected by its header type.
#[derive(Debug, Clone, PartialEq)]
pub enum CoValueContent {
    Map(CoMap),
    List(CoList),
    Stream(CoStream),
    PlainText(CoPlainText),
}

impl CoValueContent {
    /// Project `txs` according to the header's type.
    pub fn project(id: RawCoId, header: &CoValueHeader, txs: &[DecryptedTransaction]) -> Self {
        match header.co_type {
            CoValueType::CoMap => Self::Map(CoMap::from_transactions(id, txs)),
            CoValueType::CoList => Self::List(CoList::from_transactions(id, txs)),
            CoValueType::CoStream => Self::Stream(CoStream::from_transactions(id, txs)),
            CoValueType::CoPlainText => Self::PlainText(CoPlainText::from_transactions(id, txs)),
        }
    }

    pub fn co_type(&self) -> CoValueType {
        match self {
            Self::Map(_) => CoValueType::CoMap,
            Self::List(_) => CoValueType::CoList,
            Self::Stream(_) => CoValueType::CoStream,
            Self::PlainText(_) => CoValueType::CoPlainText,
        }
    }

    pub fn as_map(&self) -> Option<&CoMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&CoList> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&CoStream> {
        match self {
            Self::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn as_plain_text(&self) -> Option<&CoPlainText> {
        match self {
            Self::PlainText(text) => Some(text),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Map(map) => map.to_json(),
            Self::List(list) => list.to_json(),
            Self::Stream(stream) => stream.to_json(),
            Self::PlainText(text) => text.to_json(),
        }
    }
}
