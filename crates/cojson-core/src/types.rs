//! Identifier types shared across cojson.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::crypto::{prefixed_bytes, AgentId};
use crate::error::CoreError;

prefixed_bytes!(
    /// Content-derived identifier of a CoValue.
    ///
    /// The first 20 bytes of BLAKE3 over the canonical JSON of the header.
    RawCoId,
    20,
    "co_z"
);

/// The author of a session: an account CoValue or a bare agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActorId {
    Account(RawCoId),
    Agent(AgentId),
}

impl ActorId {
    /// The account id, if this actor is an account.
    pub fn as_account(&self) -> Option<&RawCoId> {
        match self {
            ActorId::Account(id) => Some(id),
            ActorId::Agent(_) => None,
        }
    }

    /// The agent id, if this actor is a bare agent.
    pub fn as_agent(&self) -> Option<&AgentId> {
        match self {
            ActorId::Agent(id) => Some(id),
            ActorId::Account(_) => None,
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorId::Account(id) => write!(f, "{}", id),
            ActorId::Agent(id) => write!(f, "{}", id),
        }
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorId::Account(id) => write!(f, "Account({:?})", id),
            ActorId::Agent(id) => write!(f, "{:?}", id),
        }
    }
}

impl FromStr for ActorId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(RawCoId::PREFIX) {
            return s
                .parse()
                .map(ActorId::Account)
                .map_err(|_| CoreError::InvalidId(s.to_string()));
        }
        s.parse()
            .map(ActorId::Agent)
            .map_err(|_| CoreError::InvalidId(s.to_string()))
    }
}

impl Serialize for ActorId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ActorId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

const SESSION_INFIX: &str = "_session_z";

/// One device/login's transaction stream for one actor.
///
/// Text form: `<actor>_session_z<hex>`. Ordered by its text form so that
/// tie-breaks are identical on every replica.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    actor: ActorId,
    suffix: String,
    text: String,
}

impl SessionId {
    /// Create a session for `actor` with a random suffix.
    pub fn new_random(actor: ActorId) -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(actor, hex::encode(bytes))
    }

    /// Create a session with an explicit suffix.
    pub fn new(actor: ActorId, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        let text = format!("{}{}{}", actor, SESSION_INFIX, suffix);
        Self {
            actor,
            suffix,
            text,
        }
    }

    /// The actor that authors this session.
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    /// The random suffix.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The text form.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialOrd for SessionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SessionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.text.cmp(&other.text)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({:?}, {})", self.actor, self.suffix)
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (actor, suffix) = s
            .rsplit_once(SESSION_INFIX)
            .ok_or_else(|| CoreError::InvalidId(s.to_string()))?;
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CoreError::InvalidId(s.to_string()));
        }
        Ok(Self::new(actor.parse()?, suffix))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Position of one transaction: `(session, txIndex)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionId {
    pub session_id: SessionId,
    pub tx_index: u32,
}

impl TransactionId {
    pub fn new(session_id: SessionId, tx_index: u32) -> Self {
        Self {
            session_id,
            tx_index,
        }
    }
}

/// One change inside one transaction; the identity of a list element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpId {
    pub session_id: SessionId,
    pub tx_index: u32,
    pub change_idx: u32,
}

impl OpId {
    pub fn new(tx: &TransactionId, change_idx: u32) -> Self {
        Self {
            session_id: tx.session_id.clone(),
            tx_index: tx.tx_index,
            change_idx,
        }
    }
}

/// Causal position used for every cross-session ordering decision:
/// `(madeAt, sessionId, txIndex)`, compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CausalPoint {
    pub made_at: i64,
    pub session_id: SessionId,
    pub tx_index: u32,
}

impl CausalPoint {
    pub fn new(made_at: i64, tx: &TransactionId) -> Self {
        Self {
            made_at,
            session_id: tx.session_id.clone(),
            tx_index: tx.tx_index,
        }
    }
}
