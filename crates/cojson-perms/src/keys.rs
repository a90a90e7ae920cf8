//! Key resolution and key distribution edits.
//!
//! A reader finds a key by following, in order: a plaintext reveal to
//! `everyone`, a reveal sealed to one of its identities, or an envelope
//! under another key it can resolve. Distribution builds the group edits
//! that create those reveals.

use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::trace;

use cojson_core::{ActorId, CoMap, KeyId, KeySecret, SealerId, SealerSecret};

use crate::envelope::KeyEnvelope;
use crate::error::{PermsError, Result};
use crate::group::GroupState;
use crate::roles::{GroupKey, MemberKey, RevealTarget, Role};
use crate::sealed::SealedKey;

/// Identities whose sealed reveals a reader can open.
#[derive(Clone, Default)]
pub struct Keyring {
    identities: Vec<(ActorId, SealerSecret)>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity; reveals to `actor` are opened with `sealer`.
    pub fn with(mut self, actor: ActorId, sealer: SealerSecret) -> Self {
        self.identities.push((actor, sealer));
        self
    }

    pub fn add(&mut self, actor: ActorId, sealer: SealerSecret) {
        self.identities.push((actor, sealer));
    }

    pub fn actors(&self) -> impl Iterator<Item = &ActorId> {
        self.identities.iter().map(|(actor, _)| actor)
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.actors()).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Resolve the secret of `key_id` from a group's reveals.
pub fn resolve_key(group: &GroupState, key_id: &KeyId, keyring: &Keyring) -> Result<KeySecret> {
    let mut visiting = HashSet::new();
    resolve(group, key_id, keyring, &mut visiting).ok_or(PermsError::KeyUnavailable(*key_id))
}

/// Resolve the group's current read key.
pub fn resolve_read_key(group: &GroupState, keyring: &Keyring) -> Result<(KeyId, KeySecret)> {
    let key_id = group.read_key_id().ok_or(PermsError::NoReadKey)?;
    Ok((key_id, resolve_key(group, &key_id, keyring)?))
}

fn resolve(
    group: &GroupState,
    key_id: &KeyId,
    keyring: &Keyring,
    visiting: &mut HashSet<KeyId>,
) -> Option<KeySecret> {
    if !visiting.insert(*key_id) {
        return None;
    }

    let everyone = GroupKey::reveal(key_id, &RevealTarget::Member(MemberKey::Everyone));
    if let Some(text) = group.get_str(&everyone) {
        match KeySecret::from_secret_string(text) {
            Ok(key) => return Some(key),
            Err(e) => trace!(group = %group.id(), error = %e, "malformed everyone reveal"),
        }
    }

    for (actor, sealer) in &keyring.identities {
        let map_key = GroupKey::reveal(key_id, &RevealTarget::Member(MemberKey::Actor(*actor)));
        let Some(text) = group.get_str(&map_key) else {
            continue;
        };
        match SealedKey::from_text(text).and_then(|s| s.open(key_id, group.id(), sealer)) {
            Ok(key) => return Some(key),
            Err(e) => trace!(group = %group.id(), error = %e, "cannot open sealed reveal"),
        }
    }

    let prefix = format!("{key_id}_for_");
    let envelopes: Vec<(KeyId, String)> = group
        .entries_with_prefix(&prefix)
        .filter_map(|(map_key, value)| match GroupKey::parse(map_key) {
            GroupKey::Reveal {
                target: RevealTarget::Key(outer),
                ..
            } => Some((outer, value.as_str()?.to_string())),
            _ => None,
        })
        .collect();
    for (outer, encrypted) in envelopes {
        let Some(outer_key) = resolve(group, &outer, keyring, visiting) else {
            continue;
        };
        let envelope = KeyEnvelope {
            inner: *key_id,
            outer,
            encrypted,
        };
        match envelope.unwrap_with(&outer_key) {
            Ok(key) => return Some(key),
            Err(e) => trace!(group = %group.id(), error = %e, "cannot open key envelope"),
        }
    }

    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Distribution
// ─────────────────────────────────────────────────────────────────────────────

/// Edit revealing `key` to `member`. Actors need a sealer; `everyone`
/// receives the key in plaintext.
pub fn reveal_change(
    group: &GroupState,
    key_id: &KeyId,
    key: &KeySecret,
    member: &MemberKey,
    sealer: Option<&SealerId>,
) -> Result<Value> {
    let map_key = GroupKey::reveal(key_id, &RevealTarget::Member(*member));
    let value = match member {
        MemberKey::Everyone => json!(key.to_secret_string()),
        MemberKey::Actor(actor) => {
            let sealer = sealer.ok_or_else(|| PermsError::UnknownSealer(actor.to_string()))?;
            json!(SealedKey::seal(key, key_id, group.id(), sealer)?.to_text()?)
        }
    };
    Ok(CoMap::set_op(&map_key, value))
}

/// Edit storing `inner` encrypted under `outer`.
pub fn envelope_change(
    inner: KeyId,
    inner_key: &KeySecret,
    outer: KeyId,
    outer_key: &KeySecret,
) -> Result<Value> {
    let envelope = KeyEnvelope::wrap(inner, inner_key, outer, outer_key)?;
    Ok(CoMap::set_op(&envelope.map_key(), json!(envelope.encrypted)))
}

/// A member that should receive a new read key.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub member: MemberKey,
    pub sealer: Option<SealerId>,
}

/// Members entitled to the read key: readers, writers, admins, pending
/// reader/writer/admin invites and `everyone` if it can read.
pub fn read_key_recipients(group: &GroupState) -> Vec<MemberKey> {
    group
        .members()
        .filter(|(_, role)| {
            role.can_read() || role.invite_base().is_some_and(Role::can_read)
        })
        .map(|(member, _)| *member)
        .collect()
}

/// Edits that replace the read key.
///
/// The new key is revealed to every recipient, the previous key is kept
/// reachable under the new one, and write-only members' keys are re-wrapped
/// so readers can still decrypt them.
pub fn rotation_changes(
    group: &GroupState,
    previous: Option<(KeyId, KeySecret)>,
    recipients: &[Recipient],
    write_keys: &[(KeyId, KeySecret)],
) -> Result<(KeyId, KeySecret, Vec<Value>)> {
    let new_id = KeyId::generate();
    let new_key = KeySecret::generate();

    let mut changes = Vec::with_capacity(recipients.len() + write_keys.len() + 2);
    for recipient in recipients {
        changes.push(reveal_change(
            group,
            &new_id,
            &new_key,
            &recipient.member,
            recipient.sealer.as_ref(),
        )?);
    }
    if let Some((old_id, old_key)) = &previous {
        changes.push(envelope_change(*old_id, old_key, new_id, &new_key)?);
    }
    for (write_id, write_key) in write_keys {
        changes.push(envelope_change(*write_id, write_key, new_id, &new_key)?);
    }
    changes.push(CoMap::set_op(GroupKey::READ_KEY, json!(new_id.to_string())));

    Ok((new_id, new_key, changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupTx;
    use cojson_core::{AgentSecret, CausalPoint, RawCoId, SessionId, Transaction};

    fn point(actor: &ActorId, made_at: i64, tx_index: u32) -> CausalPoint {
        CausalPoint {
            made_at,
            session_id: SessionId::new(*actor, "s"),
            tx_index,
        }
    }

    fn replay(admin: ActorId, txs: &[(CausalPoint, Transaction)]) -> GroupState {
        let txs = txs
            .iter()
            .map(|(point, tx)| GroupTx {
                point: point.clone(),
                tx,
            })
            .collect();
        GroupState::replay(RawCoId::from_bytes([8; 20]), admin, txs)
    }

    #[test]
    fn test_sealed_and_rotated_keys_resolve() {
        let admin_agent = AgentSecret::generate();
        let admin = ActorId::Agent(admin_agent.id());
        let reader_agent = AgentSecret::generate();
        let reader = ActorId::Agent(reader_agent.id());

        let bootstrap = Transaction::trusting(1, &[CoMap::set_op(&admin.to_string(), json!("admin"))]).unwrap();
        let add_reader = Transaction::trusting(2, &[CoMap::set_op(&reader.to_string(), json!("reader"))]).unwrap();
        let mut txs = vec![(point(&admin, 1, 0), bootstrap), (point(&admin, 2, 1), add_reader)];
        let state = replay(admin, &txs);

        // First key, revealed to the admin only.
        let recipients = vec![Recipient {
            member: MemberKey::Actor(admin),
            sealer: Some(admin_agent.sealer.id()),
        }];
        let (first_id, first_key, changes) = rotation_changes(&state, None, &recipients, &[]).unwrap();
        txs.push((point(&admin, 3, 2), Transaction::trusting(3, &changes).unwrap()));
        let state = replay(admin, &txs);

        let admin_ring = Keyring::new().with(admin, admin_agent.sealer.clone());
        let reader_ring = Keyring::new().with(reader, reader_agent.sealer.clone());
        assert_eq!(resolve_read_key(&state, &admin_ring).unwrap(), (first_id, first_key.clone()));
        assert!(resolve_key(&state, &first_id, &reader_ring).is_err());

        // Rotation reveals to both; the reader reaches the first key through
        // the envelope.
        let recipients = vec![
            Recipient {
                member: MemberKey::Actor(admin),
                sealer: Some(admin_agent.sealer.id()),
            },
            Recipient {
                member: MemberKey::Actor(reader),
                sealer: Some(reader_agent.sealer.id()),
            },
        ];
        let (second_id, _, changes) =
            rotation_changes(&state, Some((first_id, first_key.clone())), &recipients, &[]).unwrap();
        txs.push((point(&admin, 4, 3), Transaction::trusting(4, &changes).unwrap()));
        let state = replay(admin, &txs);

        assert_eq!(state.read_key_id(), Some(second_id));
        assert_eq!(resolve_key(&state, &first_id, &reader_ring).unwrap(), first_key);
        assert_eq!(read_key_recipients(&state).len(), 2);
    }

    #[test]
    fn test_everyone_reveal() {
        let admin = ActorId::Agent(AgentSecret::generate().id());
        let bootstrap = Transaction::trusting(1, &[CoMap::set_op(&admin.to_string(), json!("admin"))]).unwrap();
        let mut txs = vec![(point(&admin, 1, 0), bootstrap)];
        let state = replay(admin, &txs);

        let key_id = KeyId::generate();
        let key = KeySecret::generate();
        let change = reveal_change(&state, &key_id, &key, &MemberKey::Everyone, None).unwrap();
        txs.push((point(&admin, 2, 1), Transaction::trusting(2, &[change]).unwrap()));
        let state = replay(admin, &txs);

        assert_eq!(resolve_key(&state, &key_id, &Keyring::new()).unwrap(), key);
    }

    #[test]
    fn test_actor_reveal_needs_sealer() {
        let admin = ActorId::Agent(AgentSecret::generate().id());
        let state = replay(admin, &[]);
        let err = reveal_change(
            &state,
            &KeyId::generate(),
            &KeySecret::generate(),
            &MemberKey::Actor(admin),
            None,
        );
        assert!(matches!(err, Err(PermsError::UnknownSealer(_))));
    }
}
