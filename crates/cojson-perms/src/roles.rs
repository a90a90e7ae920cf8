//! Roles and group map keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use cojson_core::{ActorId, KeyId};

use crate::error::PermsError;

/// A member's role in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Reader,
    Writer,
    Admin,
    WriteOnly,
    Revoked,
    ReaderInvite,
    WriterInvite,
    AdminInvite,
    WriteOnlyInvite,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Admin => "admin",
            Role::WriteOnly => "writeOnly",
            Role::Revoked => "revoked",
            Role::ReaderInvite => "readerInvite",
            Role::WriterInvite => "writerInvite",
            Role::AdminInvite => "adminInvite",
            Role::WriteOnlyInvite => "writeOnlyInvite",
        }
    }

    /// Strength used to pick between an explicit role and `everyone`.
    pub fn rank(self) -> u8 {
        match self {
            Role::Revoked
            | Role::ReaderInvite
            | Role::WriterInvite
            | Role::AdminInvite
            | Role::WriteOnlyInvite => 0,
            Role::Reader => 1,
            Role::WriteOnly => 2,
            Role::Writer => 3,
            Role::Admin => 4,
        }
    }

    /// Can decrypt the group's read key.
    pub fn can_read(self) -> bool {
        matches!(self, Role::Reader | Role::Writer | Role::Admin)
    }

    /// Can author transactions on values owned by the group.
    pub fn can_write(self) -> bool {
        matches!(self, Role::Writer | Role::Admin | Role::WriteOnly)
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }

    pub fn is_invite(self) -> bool {
        self.invite_base().is_some()
    }

    /// The member role an invite grants.
    pub fn invite_base(self) -> Option<Role> {
        match self {
            Role::ReaderInvite => Some(Role::Reader),
            Role::WriterInvite => Some(Role::Writer),
            Role::AdminInvite => Some(Role::Admin),
            Role::WriteOnlyInvite => Some(Role::WriteOnly),
            _ => None,
        }
    }

    /// The invite role for a member role.
    pub fn invite_for(self) -> Option<Role> {
        match self {
            Role::Reader => Some(Role::ReaderInvite),
            Role::Writer => Some(Role::WriterInvite),
            Role::Admin => Some(Role::AdminInvite),
            Role::WriteOnly => Some(Role::WriteOnlyInvite),
            _ => None,
        }
    }

    /// Whether an invite of this role may hand out `role`.
    pub fn invite_allows(self, role: Role) -> bool {
        match self {
            Role::ReaderInvite => role == Role::Reader,
            Role::WriterInvite => matches!(role, Role::Reader | Role::Writer),
            Role::AdminInvite => matches!(role, Role::Reader | Role::Writer | Role::Admin),
            Role::WriteOnlyInvite => role == Role::WriteOnly,
            _ => false,
        }
    }

    /// Roles `everyone` may hold.
    pub fn allowed_for_everyone(self) -> bool {
        matches!(
            self,
            Role::Reader | Role::Writer | Role::WriteOnly | Role::Revoked
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "reader" => Role::Reader,
            "writer" => Role::Writer,
            "admin" => Role::Admin,
            "writeOnly" => Role::WriteOnly,
            "revoked" => Role::Revoked,
            "readerInvite" => Role::ReaderInvite,
            "writerInvite" => Role::WriterInvite,
            "adminInvite" => Role::AdminInvite,
            "writeOnlyInvite" => Role::WriteOnlyInvite,
            other => return Err(PermsError::InvalidRole(other.to_string())),
        })
    }
}

/// Who a role entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemberKey {
    Everyone,
    Actor(ActorId),
}

impl MemberKey {
    pub const EVERYONE: &'static str = "everyone";

    pub fn as_actor(&self) -> Option<&ActorId> {
        match self {
            MemberKey::Actor(actor) => Some(actor),
            MemberKey::Everyone => None,
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberKey::Everyone => f.write_str(Self::EVERYONE),
            MemberKey::Actor(actor) => write!(f, "{actor}"),
        }
    }
}

impl FromStr for MemberKey {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::EVERYONE {
            return Ok(MemberKey::Everyone);
        }
        s.parse()
            .map(MemberKey::Actor)
            .map_err(|_| PermsError::InvalidRole(format!("not a member key: {s}")))
    }
}

impl From<ActorId> for MemberKey {
    fn from(actor: ActorId) -> Self {
        MemberKey::Actor(actor)
    }
}

/// Recipient of a key reveal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RevealTarget {
    Member(MemberKey),
    Key(KeyId),
}

/// Classification of a group map key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKey {
    /// `<actor>` or `everyone`: a role assignment.
    Role(MemberKey),
    /// `readKey`: id of the current read key.
    ReadKey,
    /// `<keyId>_for_<target>`.
    Reveal { key: KeyId, target: RevealTarget },
    /// `writeKeyFor_<actor>`: id of a write-only member's key.
    WriteKeyFor(ActorId),
    /// Anything else.
    Other(String),
}

impl GroupKey {
    pub const READ_KEY: &'static str = "readKey";
    pub const WRITE_KEY_FOR: &'static str = "writeKeyFor_";

    pub fn parse(key: &str) -> Self {
        if key == Self::READ_KEY {
            return GroupKey::ReadKey;
        }
        if let Some(actor) = key.strip_prefix(Self::WRITE_KEY_FOR) {
            if let Ok(actor) = actor.parse() {
                return GroupKey::WriteKeyFor(actor);
            }
        }
        if let Some((key_id, target)) = key.split_once("_for_") {
            if let Ok(key_id) = key_id.parse::<KeyId>() {
                let target = match target.parse::<KeyId>() {
                    Ok(outer) => Some(RevealTarget::Key(outer)),
                    Err(_) => target.parse().ok().map(RevealTarget::Member),
                };
                if let Some(target) = target {
                    return GroupKey::Reveal {
                        key: key_id,
                        target,
                    };
                }
            }
        }
        match key.parse() {
            Ok(member) => GroupKey::Role(member),
            Err(_) => GroupKey::Other(key.to_string()),
        }
    }

    /// Map key revealing `key` to `target`.
    pub fn reveal(key: &KeyId, target: &RevealTarget) -> String {
        match target {
            RevealTarget::Member(member) => format!("{key}_for_{member}"),
            RevealTarget::Key(outer) => format!("{key}_for_{outer}"),
        }
    }

    pub fn write_key_for(actor: &ActorId) -> String {
        format!("{}{actor}", Self::WRITE_KEY_FOR)
    }
}
