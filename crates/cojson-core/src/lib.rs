//! # cojson core
//!
//! Data model and transaction core for cojson: CoValue headers, signed
//! session logs, known-state diffing and the typed content projections.
//!
//! This crate does no I/O. Permission decisions are delegated through the
//! [`Authorizer`] trait, so the only way to add a transaction to a
//! [`CoValueCore`] is [`CoValueCore::try_add_transactions`].
//!
//! ## Key Types
//!
//! - [`CoValueHeader`] - Immutable header; its canonical JSON hashes to the [`RawCoId`]
//! - [`CoValueCore`] - Header plus per-session [`SessionLog`]s
//! - [`Transaction`] - Trusting or private batch of changes
//! - [`CoValueKnownState`] - How much of a CoValue someone has
//! - [`NewContentPiece`] - Unit of content exchanged between peers
//! - [`CoValueContent`] - Typed projection (map, list, stream, text)
//!
//! ## Canonicalization
//!
//! Headers and transactions are hashed and signed over canonical JSON
//! (recursively sorted object keys). See [`canonical`].

pub mod canonical;
pub mod clock;
pub mod content;
pub mod covalue;
pub mod crypto;
pub mod error;
pub mod header;
pub mod known;
pub mod piece;
pub mod priority;
pub mod session;
pub mod transaction;
pub mod types;

pub use covalue::{AllowAll, Authorizer, CoValueCore, TransactionRef};
pub use canonical::{canonical_bytes, canonical_json};
pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use content::{CoList, CoMap, CoPlainText, CoStream, CoValueContent};
pub use crypto::{
    AgentId, AgentSecret, Blake3Hash, KeyId, KeySecret, SealerId, SealerSecret, Signature,
    SignerId, SignerSecret,
};
pub use error::{CoreError, CryptoError, Result};
pub use header::{CoValueHeader, CoValueType, Ruleset};
pub use known::CoValueKnownState;
pub use piece::{pack_pieces, NewContentPiece, SessionNewContent};
pub use priority::Priority;
pub use session::{AppendOutcome, SessionLog, MAX_RECOMMENDED_TX_SIZE};
pub use transaction::{DecryptedTransaction, Privacy, Transaction};
pub use types::{ActorId, CausalPoint, OpId, RawCoId, SessionId, TransactionId};
