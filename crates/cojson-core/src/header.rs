//! CoValue headers: the immutable identity of a CoValue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::canonical::canonical_bytes;
use crate::error::{CoreError, Result};
use crate::priority::Priority;
use crate::types::{ActorId, RawCoId};

/// The content type of a CoValue, selecting its projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CoValueType {
    CoMap,
    CoList,
    CoStream,
    CoPlainText,
}

impl CoValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            CoValueType::CoMap => "comap",
            CoValueType::CoList => "colist",
            CoValueType::CoStream => "costream",
            CoValueType::CoPlainText => "coplaintext",
        }
    }
}

impl fmt::Display for CoValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoValueType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "comap" => Ok(CoValueType::CoMap),
            "colist" => Ok(CoValueType::CoList),
            "costream" => Ok(CoValueType::CoStream),
            "coplaintext" => Ok(CoValueType::CoPlainText),
            other => Err(CoreError::UnknownCoValueType(other.to_string())),
        }
    }
}

impl TryFrom<String> for CoValueType {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CoValueType> for String {
    fn from(t: CoValueType) -> Self {
        t.as_str().to_string()
    }
}

/// The authorization rule of a CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// The CoValue is a permission group governing itself.
    #[serde(rename_all = "camelCase")]
    Group { initial_admin: ActorId },
    /// Authorization is delegated to a group.
    OwnedByGroup { group: RawCoId },
    /// No authorization check.
    UnsafeAllowAll,
}

/// Immutable CoValue header. Its canonical JSON hashes to the CoValue id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub co_type: CoValueType,
    pub ruleset: Ruleset,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub uniqueness: Option<String>,
}

impl CoValueHeader {
    /// A header with a fresh random uniqueness value.
    pub fn new(co_type: CoValueType, ruleset: Ruleset, created_at: i64) -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            co_type,
            ruleset,
            meta: None,
            created_at: Some(created_at),
            uniqueness: Some(format!("z{}", hex::encode(bytes))),
        }
    }

    /// Attach metadata.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Replace the uniqueness value.
    pub fn with_uniqueness(mut self, uniqueness: Option<String>) -> Self {
        self.uniqueness = uniqueness;
        self
    }

    /// Compute the content-derived id.
    pub fn id(&self) -> Result<RawCoId> {
        let bytes = canonical_bytes(self)?;
        let hash = blake3::hash(&bytes);
        let mut id = [0u8; 20];
        id.copy_from_slice(&hash.as_bytes()[..20]);
        Ok(RawCoId::from_bytes(id))
    }

    /// `meta.type`, if present.
    pub fn meta_type(&self) -> Option<&str> {
        self.meta.as_ref()?.get("type")?.as_str()
    }

    pub fn is_group(&self) -> bool {
        matches!(self.ruleset, Ruleset::Group { .. })
    }

    pub fn is_account(&self) -> bool {
        self.is_group() && self.meta_type() == Some("account")
    }

    pub fn is_binary_stream(&self) -> bool {
        self.co_type == CoValueType::CoStream && self.meta_type() == Some("binary")
    }

    /// The owning group, for `ownedByGroup` CoValues.
    pub fn owner(&self) -> Option<&RawCoId> {
        match &self.ruleset {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }

    /// Default sync priority of this CoValue's content.
    pub fn priority(&self) -> Priority {
        if self.is_group() {
            Priority::HIGH
        } else if self.is_binary_stream() {
            Priority::LOW
        } else {
            Priority::MEDIUM
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owned_map() -> CoValueHeader {
        CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::OwnedByGroup {
                group: RawCoId::from_bytes([1; 20]),
            },
            1_700_000_000_000,
        )
    }

    #[test]
    fn test_id_is_deterministic() {
        let header = owned_map();
        assert_eq!(header.id().unwrap(), header.clone().id().unwrap());

        let other = header.clone().with_uniqueness(Some("zother".into()));
        assert_ne!(header.id().unwrap(), other.id().unwrap());
    }

    #[test]
    fn test_wire_shape() {
        let header = owned_map().with_uniqueness(None);
        let value = serde_json::to_value(&header).unwrap();
        assert_eq!(value["type"], "comap");
        assert_eq!(value["ruleset"]["type"], "ownedByGroup");
        assert_eq!(value["createdAt"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = "cograph".parse::<CoValueType>().unwrap_err();
        assert!(matches!(err, CoreError::UnknownCoValueType(_)));

        let raw = json!({"type": "cograph", "ruleset": {"type": "unsafeAllowAll"}});
        assert!(serde_json::from_value::<CoValueHeader>(raw).is_err());
    }

    #[test]
    fn test_priorities() {
        let group = CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::Group {
                initial_admin: ActorId::Account(RawCoId::from_bytes([2; 20])),
            },
            0,
        );
        assert_eq!(group.priority(), Priority::HIGH);
        assert_eq!(owned_map().priority(), Priority::MEDIUM);

        let binary = CoValueHeader::new(CoValueType::CoStream, Ruleset::UnsafeAllowAll, 0)
            .with_meta(json!({"type": "binary"}));
        assert_eq!(binary.priority(), Priority::LOW);
    }
}
