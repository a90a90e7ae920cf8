//! Transactions: the signed unit of change inside a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::canonical_json;
use crate::crypto::{KeyId, KeySecret};
use crate::error::{CoreError, Result};
use crate::types::{ActorId, RawCoId, SessionId, TransactionId};

/// Privacy tier of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Privacy {
    Trusting,
    Private,
}

/// A transaction as stored and transmitted.
///
/// `changes` of a trusting transaction is the JSON text of the change list,
/// kept verbatim so the signed bytes never depend on re-serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "camelCase")]
pub enum Transaction {
    #[serde(rename_all = "camelCase")]
    Trusting { made_at: i64, changes: String },
    #[serde(rename_all = "camelCase")]
    Private {
        made_at: i64,
        key_used: KeyId,
        encrypted_changes: String,
    },
}

impl Transaction {
    /// Build a trusting transaction from a list of changes.
    pub fn trusting(made_at: i64, changes: &[Value]) -> Result<Self> {
        Ok(Transaction::Trusting {
            made_at,
            changes: serde_json::to_string(changes)?,
        })
    }

    /// Build a private transaction, encrypting the changes for the given
    /// position in the CoValue.
    pub fn private(
        made_at: i64,
        changes: &[Value],
        key_id: KeyId,
        key: &KeySecret,
        co_id: &RawCoId,
        tx_id: &TransactionId,
    ) -> Result<Self> {
        let plaintext = serde_json::to_vec(changes)?;
        let encrypted_changes = key.encrypt(&plaintext, &nonce_material(co_id, tx_id))?;
        Ok(Transaction::Private {
            made_at,
            key_used: key_id,
            encrypted_changes,
        })
    }

    pub fn made_at(&self) -> i64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => {
                *made_at
            }
        }
    }

    pub fn privacy(&self) -> Privacy {
        match self {
            Transaction::Trusting { .. } => Privacy::Trusting,
            Transaction::Private { .. } => Privacy::Private,
        }
    }

    /// The key epoch of a private transaction.
    pub fn key_used(&self) -> Option<&KeyId> {
        match self {
            Transaction::Private { key_used, .. } => Some(key_used),
            Transaction::Trusting { .. } => None,
        }
    }

    /// The bytes fed into the session hash.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        canonical_json(self).map(String::into_bytes)
    }

    /// Approximate serialized size, used for chunking.
    pub fn size_estimate(&self) -> usize {
        match self {
            Transaction::Trusting { changes, .. } => changes.len() + 48,
            Transaction::Private {
                encrypted_changes, ..
            } => encrypted_changes.len() + 96,
        }
    }

    /// Parse trusting changes. Private transactions need [`Transaction::decrypt_changes`].
    pub fn trusting_changes(&self) -> Option<Result<Vec<Value>>> {
        match self {
            Transaction::Trusting { changes, .. } => {
                Some(serde_json::from_str(changes).map_err(CoreError::from))
            }
            Transaction::Private { .. } => None,
        }
    }

    /// Decrypt and parse the changes of a private transaction.
    pub fn decrypt_changes(
        &self,
        key: &KeySecret,
        co_id: &RawCoId,
        tx_id: &TransactionId,
    ) -> Result<Vec<Value>> {
        match self {
            Transaction::Private {
                encrypted_changes, ..
            } => {
                let plaintext = key.decrypt(encrypted_changes, &nonce_material(co_id, tx_id))?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
            Transaction::Trusting { changes, .. } => Ok(serde_json::from_str(changes)?),
        }
    }
}

fn nonce_material(co_id: &RawCoId, tx_id: &TransactionId) -> Vec<u8> {
    format!("{}|{}|{}", co_id, tx_id.session_id, tx_id.tx_index).into_bytes()
}

/// A validated transaction whose changes are readable.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedTransaction {
    pub tx_id: TransactionId,
    pub author: ActorId,
    pub made_at: i64,
    pub changes: Vec<Value>,
}

impl DecryptedTransaction {
    /// Deterministic total order used by every projection.
    pub fn sort_key(&self) -> (i64, &SessionId, u32) {
        (self.made_at, &self.tx_id.session_id, self.tx_id.tx_index)
    }
}
