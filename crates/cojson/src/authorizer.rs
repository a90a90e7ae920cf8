//! Admission rules for a node's CoValues.
//!
//! Signers are resolved through accounts held by the node; writes are
//! checked against the group ruleset or the owning group.

use std::collections::HashMap;

use cojson_core::{
    ActorId, Authorizer, CoValueCore, CoreError, RawCoId, Ruleset, SessionId, SignerId,
    Transaction,
};
use cojson_perms::GroupState;

/// [`Authorizer`] backed by the CoValues a node holds.
///
/// The core being written to is passed separately, so it may be absent
/// from `co_values` while it is borrowed mutably.
pub struct NodeAuthorizer<'a> {
    co_values: &'a HashMap<RawCoId, CoValueCore>,
}

impl<'a> NodeAuthorizer<'a> {
    pub fn new(co_values: &'a HashMap<RawCoId, CoValueCore>) -> Self {
        Self { co_values }
    }

    fn lookup<'c>(&'c self, core: &'c CoValueCore, id: &RawCoId) -> Result<&'c CoValueCore, CoreError> {
        if core.id() == id {
            return Ok(core);
        }
        self.co_values
            .get(id)
            .ok_or(CoreError::MissingDependency(*id))
    }
}

impl Authorizer for NodeAuthorizer<'_> {
    fn signers_for(&self, core: &CoValueCore, actor: &ActorId) -> Result<Vec<SignerId>, CoreError> {
        match actor {
            ActorId::Agent(agent) => Ok(vec![agent.signer]),
            ActorId::Account(account) => {
                let account_core = self.lookup(core, account)?;
                if !account_core.header().is_account() {
                    return Err(CoreError::PermissionDenied(format!(
                        "{account} is not an account"
                    )));
                }
                let state = GroupState::from_core(account_core)?;
                Ok(state.admin_agents().iter().map(|a| a.signer).collect())
            }
        }
    }

    fn admit(
        &self,
        core: &CoValueCore,
        session: &SessionId,
        first_index: u32,
        txs: &[Transaction],
    ) -> Result<(), CoreError> {
        match &core.header().ruleset {
            Ruleset::UnsafeAllowAll => Ok(()),
            Ruleset::Group { .. } => {
                GroupState::admit(core, session, first_index, txs).map_err(CoreError::from)
            }
            Ruleset::OwnedByGroup { group } => {
                let group_core = self.lookup(core, group)?;
                let state = GroupState::from_core(group_core)?;
                for tx in txs {
                    state.check_owned_write(session.actor(), tx)?;
                }
                Ok(())
            }
        }
    }
}
