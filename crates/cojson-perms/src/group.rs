//! Group state: who holds which role, and which entries are valid.
//!
//! ## Overview
//!
//! A group is a CoValue with the `group` ruleset whose trusting
//! transactions are map edits. Its state is computed by replaying the
//! transactions in causal order `(madeAt, sessionId, txIndex)` in two passes:
//!
//! 1. **Roles.** Every edit of a member key (`<actor>` or `everyone`) is
//!    checked against the roles assigned so far and, if valid, appended to
//!    that member's timeline.
//! 2. **Everything else.** `readKey`, key reveals, `writeKeyFor_*` and
//!    arbitrary keys are checked against the author's role strictly before
//!    the transaction's own causal point.
//!
//! Invalid edits are skipped and recorded as [`Rejection`]s. Admission of a
//! new batch replays the group with the batch included and refuses it if
//! any of its edits is rejected.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use cojson_core::{
    ActorId, AgentId, CausalPoint, CoValueCore, KeyId, RawCoId, Ruleset, SessionId, Transaction,
    TransactionId,
};

use crate::error::{PermsError, Result};
use crate::roles::{GroupKey, MemberKey, RevealTarget, Role};

/// One transaction of a group, positioned.
#[derive(Debug, Clone)]
pub struct GroupTx<'a> {
    pub point: CausalPoint,
    pub tx: &'a Transaction,
}

impl GroupTx<'_> {
    fn author(&self) -> ActorId {
        *self.point.session_id.actor()
    }

    fn tx_id(&self) -> TransactionId {
        TransactionId::new(self.point.session_id.clone(), self.point.tx_index)
    }
}

/// A role assignment that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleEntry {
    pub point: CausalPoint,
    /// `None` when the member key was deleted.
    pub role: Option<Role>,
    pub by: ActorId,
}

/// A non-role edit that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub point: CausalPoint,
    /// `None` for deletions.
    pub value: Option<Value>,
    pub by: ActorId,
}

/// An edit skipped during replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub tx_id: TransactionId,
    /// `None` when the whole transaction was unusable.
    pub change_idx: Option<u32>,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum GroupChange {
    Set { key: String, value: Value },
    Del { key: String },
}

/// Replayed state of one group.
#[derive(Debug, Clone)]
pub struct GroupState {
    id: RawCoId,
    initial_admin: ActorId,
    roles: BTreeMap<MemberKey, Vec<RoleEntry>>,
    entries: BTreeMap<String, Vec<Entry>>,
    used_invites: HashSet<ActorId>,
    rejections: Vec<Rejection>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay
// ─────────────────────────────────────────────────────────────────────────────

struct PendingEntry {
    point: CausalPoint,
    author: ActorId,
    tx_id: TransactionId,
    change_idx: u32,
    key: GroupKey,
    raw_key: String,
    value: Option<Value>,
}

impl GroupState {
    /// Replay a group core.
    pub fn from_core(core: &CoValueCore) -> Result<Self> {
        let txs: Vec<GroupTx<'_>> = core
            .transactions_in_causal_order()
            .into_iter()
            .map(|r| GroupTx {
                point: r.causal_point(),
                tx: r.tx,
            })
            .collect();
        Self::replay_core(core, txs)
    }

    fn replay_core(core: &CoValueCore, txs: Vec<GroupTx<'_>>) -> Result<Self> {
        match &core.header().ruleset {
            Ruleset::Group { initial_admin } => Ok(Self::replay(*core.id(), *initial_admin, txs)),
            _ => Err(PermsError::NotAGroup(core.id().to_string())),
        }
    }

    /// Replay positioned transactions, in any order.
    pub fn replay(id: RawCoId, initial_admin: ActorId, mut txs: Vec<GroupTx<'_>>) -> Self {
        txs.sort_by(|a, b| a.point.cmp(&b.point));

        let mut state = Self {
            id,
            initial_admin,
            roles: BTreeMap::new(),
            entries: BTreeMap::new(),
            used_invites: HashSet::new(),
            rejections: Vec::new(),
        };

        // Pass 1: roles.
        let mut pending = Vec::new();
        for gtx in &txs {
            let author = gtx.author();
            let tx_id = gtx.tx_id();
            let changes = match gtx.tx.trusting_changes() {
                Some(Ok(changes)) => changes,
                Some(Err(e)) => {
                    state.reject(tx_id, None, format!("undecodable changes: {e}"));
                    continue;
                }
                None => {
                    state.reject(tx_id, None, "group transactions must be trusting".into());
                    continue;
                }
            };

            for (idx, change) in changes.iter().enumerate() {
                let change_idx = idx as u32;
                let (raw_key, value) = match GroupChange::deserialize(change) {
                    Ok(GroupChange::Set { key, value }) => (key, Some(value)),
                    Ok(GroupChange::Del { key }) => (key, None),
                    Err(e) => {
                        state.reject(tx_id.clone(), Some(change_idx), format!("malformed change: {e}"));
                        continue;
                    }
                };

                let member = match GroupKey::parse(&raw_key) {
                    GroupKey::Role(member) => member,
                    key => {
                        pending.push(PendingEntry {
                            point: gtx.point.clone(),
                            author,
                            tx_id: tx_id.clone(),
                            change_idx,
                            key,
                            raw_key,
                            value,
                        });
                        continue;
                    }
                };

                let role = match value.as_ref().map(parse_role).transpose() {
                    Ok(role) => role,
                    Err(e) => {
                        state.reject(tx_id.clone(), Some(change_idx), e.to_string());
                        continue;
                    }
                };
                match state.check_assignment(&author, &member, role) {
                    Ok(()) => {
                        if state.explicit_role(&MemberKey::Actor(author)).is_some_and(Role::is_invite)
                        {
                            state.used_invites.insert(author);
                        }
                        state.roles.entry(member).or_default().push(RoleEntry {
                            point: gtx.point.clone(),
                            role,
                            by: author,
                        });
                    }
                    Err(reason) => state.reject(tx_id.clone(), Some(change_idx), reason),
                }
            }
        }

        // Pass 2: everything else, against roles before each transaction.
        for entry in pending {
            match state.check_entry(&entry) {
                Ok(()) => state.entries.entry(entry.raw_key).or_default().push(Entry {
                    point: entry.point,
                    value: entry.value,
                    by: entry.author,
                }),
                Err(reason) => state.reject(entry.tx_id, Some(entry.change_idx), reason),
            }
        }

        state
    }

    fn reject(&mut self, tx_id: TransactionId, change_idx: Option<u32>, reason: String) {
        debug!(group = %self.id, tx = ?tx_id, change_idx = ?change_idx, %reason, "group edit rejected");
        self.rejections.push(Rejection {
            tx_id,
            change_idx,
            reason,
        });
    }

    fn check_assignment(
        &self,
        author: &ActorId,
        member: &MemberKey,
        role: Option<Role>,
    ) -> std::result::Result<(), String> {
        let author_role = self.explicit_role(&MemberKey::Actor(*author));
        let target_role = self.explicit_role(member);
        let is_self = member.as_actor() == Some(author);

        if is_self
            && role == Some(Role::Admin)
            && *author == self.initial_admin
            && !self.has_admin()
        {
            return Ok(());
        }

        match author_role {
            Some(Role::Admin) => {
                if *member == MemberKey::Everyone {
                    return match role {
                        Some(r) if !r.allowed_for_everyone() => {
                            Err(format!("everyone cannot be {r}"))
                        }
                        _ => Ok(()),
                    };
                }
                if target_role == Some(Role::Admin) && !is_self && role != Some(Role::Admin) {
                    return Err("admins cannot demote other admins".into());
                }
                Ok(())
            }
            Some(invite) if invite.is_invite() => {
                let Some(role) = role else {
                    return Err("invites cannot remove members".into());
                };
                if !invite.invite_allows(role) {
                    return Err(format!("{invite} cannot grant {role}"));
                }
                if *member == MemberKey::Everyone || is_self {
                    return Err("invites grant roles to other members only".into());
                }
                if self.used_invites.contains(author) {
                    return Err("invite already used".into());
                }
                if let Some(current) = target_role {
                    if current == Role::Admin || current.rank() >= role.rank() {
                        return Err(format!("member is already {current}"));
                    }
                }
                Ok(())
            }
            _ => Err(format!("{author} is not an admin")),
        }
    }

    fn check_entry(&self, entry: &PendingEntry) -> std::result::Result<(), String> {
        let role = self.explicit_role_before(&MemberKey::Actor(entry.author), &entry.point);
        if role == Some(Role::Admin) {
            return Ok(());
        }
        match &entry.key {
            GroupKey::Reveal {
                target: RevealTarget::Member(MemberKey::Actor(target)),
                ..
            } if *target == entry.author || role.is_some_and(Role::is_invite) => Ok(()),
            GroupKey::WriteKeyFor(_) if role == Some(Role::WriteOnlyInvite) => Ok(()),
            _ => Err(format!("{} needs admin", entry.raw_key)),
        }
    }
}

fn parse_role(value: &Value) -> Result<Role> {
    value
        .as_str()
        .ok_or_else(|| PermsError::InvalidRole(value.to_string()))?
        .parse()
}

fn effective(explicit: Option<Role>, everyone: Option<Role>) -> Option<Role> {
    match (explicit, everyone) {
        (Some(own), Some(all)) if all.rank() > own.rank() => Some(all),
        (Some(own), _) => Some(own),
        (None, all) => all,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

impl GroupState {
    pub fn id(&self) -> &RawCoId {
        &self.id
    }

    pub fn initial_admin(&self) -> &ActorId {
        &self.initial_admin
    }

    /// Edits skipped during replay.
    pub fn rejections(&self) -> &[Rejection] {
        &self.rejections
    }

    fn has_admin(&self) -> bool {
        self.roles
            .values()
            .any(|timeline| timeline.last().and_then(|e| e.role) == Some(Role::Admin))
    }

    /// Current role assigned to `member` itself, ignoring `everyone`.
    pub fn explicit_role(&self, member: &MemberKey) -> Option<Role> {
        self.roles.get(member)?.last()?.role
    }

    fn explicit_role_before(&self, member: &MemberKey, point: &CausalPoint) -> Option<Role> {
        self.roles
            .get(member)?
            .iter()
            .take_while(|e| e.point < *point)
            .last()?
            .role
    }

    fn explicit_role_at_time(&self, member: &MemberKey, made_at: i64) -> Option<Role> {
        self.roles
            .get(member)?
            .iter()
            .take_while(|e| e.point.made_at <= made_at)
            .last()?
            .role
    }

    /// Current effective role of `actor`, `everyone` included.
    pub fn role_of(&self, actor: &ActorId) -> Option<Role> {
        effective(
            self.explicit_role(&MemberKey::Actor(*actor)),
            self.explicit_role(&MemberKey::Everyone),
        )
    }

    /// Effective role of `actor` at a point in group time: every assignment
    /// made at or before `made_at` counts.
    pub fn role_at(&self, actor: &ActorId, made_at: i64) -> Option<Role> {
        effective(
            self.explicit_role_at_time(&MemberKey::Actor(*actor), made_at),
            self.explicit_role_at_time(&MemberKey::Everyone, made_at),
        )
    }

    /// Members with a current explicit role.
    pub fn members(&self) -> impl Iterator<Item = (&MemberKey, Role)> {
        self.roles
            .iter()
            .filter_map(|(member, timeline)| Some((member, timeline.last()?.role?)))
    }

    /// Agents currently holding `admin`; the signers of an account.
    pub fn admin_agents(&self) -> Vec<AgentId> {
        self.members()
            .filter(|(_, role)| role.is_admin())
            .filter_map(|(member, _)| member.as_actor()?.as_agent().copied())
            .collect()
    }

    /// Latest valid value of a non-role key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)?.last()?.value.as_ref()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Live non-role entries whose key starts with `prefix`.
    pub fn entries_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        self.entries
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .filter_map(|(k, edits)| Some((k.as_str(), edits.last()?.value.as_ref()?)))
    }

    /// Id of the current read key.
    pub fn read_key_id(&self) -> Option<KeyId> {
        self.get_str(GroupKey::READ_KEY)?.parse().ok()
    }

    /// Id of the write key of a write-only member.
    pub fn write_key_for(&self, actor: &ActorId) -> Option<KeyId> {
        self.get_str(&GroupKey::write_key_for(actor))?.parse().ok()
    }

    /// Members and values as JSON, roles included.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (member, role) in self.members() {
            map.insert(member.to_string(), Value::String(role.to_string()));
        }
        for (key, edits) in &self.entries {
            if let Some(value) = edits.last().and_then(|e| e.value.clone()) {
                map.insert(key.clone(), value);
            }
        }
        Value::Object(map)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission
// ─────────────────────────────────────────────────────────────────────────────

impl GroupState {
    /// Admit a batch about to be appended to a group core.
    pub fn admit(
        core: &CoValueCore,
        session: &SessionId,
        first_index: u32,
        new_txs: &[Transaction],
    ) -> Result<()> {
        let mut txs: Vec<GroupTx<'_>> = core
            .transactions_in_causal_order()
            .into_iter()
            .map(|r| GroupTx {
                point: r.causal_point(),
                tx: r.tx,
            })
            .collect();
        txs.extend(new_txs.iter().enumerate().map(|(i, tx)| GroupTx {
            point: CausalPoint {
                made_at: tx.made_at(),
                session_id: session.clone(),
                tx_index: first_index + i as u32,
            },
            tx,
        }));

        let state = Self::replay_core(core, txs)?;
        let end = first_index + new_txs.len() as u32;
        match state.rejections.iter().find(|r| {
            r.tx_id.session_id == *session && (first_index..end).contains(&r.tx_id.tx_index)
        }) {
            Some(rejection) => Err(PermsError::PermissionDenied(rejection.reason.clone())),
            None => Ok(()),
        }
    }

    /// Check a transaction by `author` on a value this group owns.
    pub fn check_owned_write(&self, author: &ActorId, tx: &Transaction) -> Result<()> {
        match self.role_at(author, tx.made_at()) {
            Some(role) if role.can_write() => Ok(()),
            Some(role) => Err(PermsError::PermissionDenied(format!(
                "{author} is {role} in {}",
                self.id
            ))),
            None => Err(PermsError::PermissionDenied(format!(
                "{author} is not a member of {}",
                self.id
            ))),
        }
    }
}
