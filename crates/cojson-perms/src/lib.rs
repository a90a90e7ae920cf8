//! # cojson permissions
//!
//! The group permission model: role timelines, validation of group edits,
//! key distribution and invites.
//!
//! ## Overview
//!
//! A group is an ordinary CoValue with the `group` ruleset. Membership and
//! key material are map edits on it; nothing is mutable outside its
//! transaction log. [`GroupState`] replays that log in causal order and is
//! the only source of role decisions, both for the group itself and for
//! the CoValues it owns.
//!
//! ## Encryption Model
//!
//! Private transactions are encrypted with the group's read key:
//!
//! 1. **Read key**: A symmetric key (ChaCha20-Poly1305) named by `readKey`
//! 2. **Reveals**: The read key is sealed to each reader's sealer via
//!    ephemeral X25519 key agreement ([`SealedKey`])
//! 3. **Envelopes**: Old keys are encrypted under new ones ([`KeyEnvelope`]),
//!    so rotation keeps history readable for current readers
//!
//! Removing a member rotates the read key and reveals the new key only to
//! the remaining readers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cojson_perms::{resolve_read_key, GroupState, Keyring, Role};
//!
//! // let state = GroupState::from_core(&group_core)?;
//! // let role = state.role_of(&actor);
//! // let (key_id, key) = resolve_read_key(&state, &Keyring::new().with(me, sealer))?;
//! ```

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod group;
pub mod invite;
pub mod keys;
pub mod roles;
pub mod sealed;

pub use crypto::{EphemeralKeyPair, SharedKey, WrapKey, WrapNonce};
pub use envelope::KeyEnvelope;
pub use error::{PermsError, Result};
pub use group::{Entry, GroupState, GroupTx, Rejection, RoleEntry};
pub use invite::{accept_invite_changes, create_invite_changes, InviteSecret};
pub use keys::{
    envelope_change, read_key_recipients, resolve_key, resolve_read_key, reveal_change,
    rotation_changes, Keyring, Recipient,
};
pub use roles::{GroupKey, MemberKey, RevealTarget, Role};
pub use sealed::{SealedKey, SEALED_PREFIX};
