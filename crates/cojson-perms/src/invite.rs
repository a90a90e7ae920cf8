//! Invites.
//!
//! An invite is a fresh agent added to the group with an invite role
//! (`readerInvite`, `writerInvite`, `adminInvite`, `writeOnlyInvite`). Its
//! secret travels out of band as `inviteSecret_z<hex seed>`. Whoever holds
//! the secret writes, from a session of the invite agent, the new member's role
//! assignment and a reveal of the key it needs. Each invite assigns once.

use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use cojson_core::{ActorId, AgentSecret, CoMap, KeyId, KeySecret, SealerId};

use crate::error::{PermsError, Result};
use crate::group::GroupState;
use crate::keys::{envelope_change, resolve_key, resolve_read_key, reveal_change, Keyring};
use crate::roles::{GroupKey, MemberKey, Role};

/// The out-of-band secret of an invite.
#[derive(Clone, PartialEq, Eq)]
pub struct InviteSecret([u8; 32]);

impl InviteSecret {
    pub const PREFIX: &'static str = "inviteSecret_z";

    /// A fresh invite secret.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self(seed)
    }

    /// The invite agent this secret controls.
    pub fn agent(&self) -> AgentSecret {
        AgentSecret::from_seed(&self.0)
    }

    pub fn actor(&self) -> ActorId {
        ActorId::Agent(self.agent().id())
    }
}

impl fmt::Display for InviteSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl fmt::Debug for InviteSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InviteSecret({:?})", self.agent().id())
    }
}

impl FromStr for InviteSecret {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| PermsError::InvalidInvite("missing prefix".into()))?;
        let bytes = hex::decode(body).map_err(|e| PermsError::InvalidInvite(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PermsError::InvalidInvite("invalid length".into()))?;
        Ok(Self(seed))
    }
}

/// Admin edits creating an invite for `role`.
///
/// Reader, writer and admin invites receive the current read key. Write-only
/// invites receive a new write key, wrapped under the read key so readers
/// can decrypt what the invited member writes.
pub fn create_invite_changes(
    group: &GroupState,
    admin_keyring: &Keyring,
    role: Role,
    secret: &InviteSecret,
) -> Result<Vec<Value>> {
    let invite_role = role
        .invite_for()
        .ok_or_else(|| PermsError::InvalidRole(format!("cannot invite as {role}")))?;
    let agent = secret.agent();
    let invite_actor = ActorId::Agent(agent.id());
    let invite_member = MemberKey::Actor(invite_actor);
    let (read_id, read_key) = resolve_read_key(group, admin_keyring)?;

    let mut changes = vec![CoMap::set_op(&invite_actor.to_string(), json!(invite_role.as_str()))];
    if role == Role::WriteOnly {
        let write_id = KeyId::generate();
        let write_key = KeySecret::generate();
        changes.push(CoMap::set_op(
            &GroupKey::write_key_for(&invite_actor),
            json!(write_id.to_string()),
        ));
        changes.push(reveal_change(
            group,
            &write_id,
            &write_key,
            &invite_member,
            Some(&agent.sealer.id()),
        )?);
        changes.push(envelope_change(write_id, &write_key, read_id, &read_key)?);
    } else {
        changes.push(reveal_change(
            group,
            &read_id,
            &read_key,
            &invite_member,
            Some(&agent.sealer.id()),
        )?);
    }
    Ok(changes)
}

/// Edits, authored by the invite agent, that admit `member`.
pub fn accept_invite_changes(
    group: &GroupState,
    secret: &InviteSecret,
    member: &ActorId,
    member_sealer: &SealerId,
) -> Result<Vec<Value>> {
    let agent = secret.agent();
    let invite_actor = ActorId::Agent(agent.id());
    let invite_role = group
        .explicit_role(&MemberKey::Actor(invite_actor))
        .filter(|r| r.is_invite())
        .ok_or_else(|| PermsError::InvalidInvite("invite is not part of this group".into()))?;
    let role = invite_role
        .invite_base()
        .ok_or_else(|| PermsError::InvalidInvite(invite_role.to_string()))?;

    let keyring = Keyring::new().with(invite_actor, agent.sealer.clone());
    let member_key = MemberKey::Actor(*member);

    let mut changes = vec![CoMap::set_op(&member.to_string(), json!(role.as_str()))];
    if role == Role::WriteOnly {
        let write_id = group
            .write_key_for(&invite_actor)
            .ok_or_else(|| PermsError::InvalidInvite("write-only invite without key".into()))?;
        let write_key = resolve_key(group, &write_id, &keyring)?;
        changes.push(CoMap::set_op(
            &GroupKey::write_key_for(member),
            json!(write_id.to_string()),
        ));
        changes.push(reveal_change(group, &write_id, &write_key, &member_key, Some(member_sealer))?);
    } else {
        let (read_id, read_key) = resolve_read_key(group, &keyring)?;
        changes.push(reveal_change(group, &read_id, &read_key, &member_key, Some(member_sealer))?);
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_text_roundtrip() {
        let secret = InviteSecret::generate();
        let text = secret.to_string();
        assert!(text.starts_with(InviteSecret::PREFIX));

        let parsed: InviteSecret = text.parse().unwrap();
        assert_eq!(parsed, secret);
        assert_eq!(parsed.actor(), secret.actor());
    }

    #[test]
    fn test_malformed_secret() {
        assert!("inviteSecret_zabc".parse::<InviteSecret>().is_err());
        assert!("nope".parse::<InviteSecret>().is_err());
    }
}
