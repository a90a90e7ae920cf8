//! The local node: the CoValues this process holds.
//!
//! Local edits and content received from peers take the same route into
//! a [`CoValueCore`]: signed, checked by [`NodeAuthorizer`], appended.
//! Nothing reaches subscribers or peers without passing through it.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, trace, warn};

use cojson_core::{
    ActorId, AgentSecret, AppendOutcome, Clock, CoList, CoMap, CoPlainText, CoStream,
    CoValueContent, CoValueCore, CoValueHeader, CoValueKnownState, CoValueType, CoreError,
    DecryptedTransaction, KeyId, KeySecret, NewContentPiece, Privacy, RawCoId, Ruleset,
    SealerId, SessionId, Signature, SignerSecret, Transaction, TransactionId, TransactionRef,
};
use cojson_perms::{
    accept_invite_changes, create_invite_changes, envelope_change, read_key_recipients,
    resolve_key, resolve_read_key, reveal_change, rotation_changes, GroupKey, GroupState,
    InviteSecret, Keyring, MemberKey, Recipient, Role,
};
use cojson_sync::{ApplyReport, SyncHost};

use crate::authorizer::NodeAuthorizer;
use crate::error::{NodeError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Views and options
// ─────────────────────────────────────────────────────────────────────────────

/// A materialized CoValue.
#[derive(Debug, Clone)]
pub enum CoValueView {
    Content(CoValueContent),
    Group(GroupState),
}

impl CoValueView {
    pub fn as_content(&self) -> Option<&CoValueContent> {
        match self {
            CoValueView::Content(content) => Some(content),
            CoValueView::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupState> {
        match self {
            CoValueView::Group(group) => Some(group),
            CoValueView::Content(_) => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CoValueView::Content(content) => content.to_json(),
            CoValueView::Group(group) => group.to_json(),
        }
    }
}

/// How a new CoValue is governed and written.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Owning group. Without one the value accepts any signed write.
    pub owner: Option<RawCoId>,
    /// Defaults to private for owned values and trusting otherwise.
    pub privacy: Option<Privacy>,
    pub meta: Option<Value>,
}

impl CreateOptions {
    pub fn owned_by(group: RawCoId) -> Self {
        Self {
            owner: Some(group),
            ..Self::default()
        }
    }

    /// Write changes in plaintext even when owned by a group.
    pub fn trusting(mut self) -> Self {
        self.privacy = Some(Privacy::Trusting);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Handle returned by [`LocalNode::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&CoValueView) + Send>;

// ─────────────────────────────────────────────────────────────────────────────
// Local node
// ─────────────────────────────────────────────────────────────────────────────

/// The CoValues held by one account on one device.
pub struct LocalNode {
    agent: AgentSecret,
    account: RawCoId,
    /// Session for everything this node writes as its account.
    session: SessionId,
    keyring: Keyring,
    clock: Arc<dyn Clock>,
    co_values: HashMap<RawCoId, CoValueCore>,
    privacy: HashMap<RawCoId, Privacy>,
    changed: Vec<RawCoId>,
    subscriptions: HashMap<RawCoId, Vec<(SubscriptionId, Listener)>>,
    next_subscription: u64,
}

impl LocalNode {
    /// Create a new account with a fresh agent.
    pub fn create_account(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::create_account_with(AgentSecret::generate(), clock)
    }

    /// Create a new account controlled by `agent`.
    ///
    /// The account is a group whose only admin is the agent. It holds a
    /// read key revealed to the agent.
    pub fn create_account_with(agent: AgentSecret, clock: Arc<dyn Clock>) -> Result<Self> {
        let agent_actor = ActorId::Agent(agent.id());
        let header = CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::Group {
                initial_admin: agent_actor,
            },
            clock.now_millis(),
        )
        .with_meta(json!({"type": "account"}));
        let core = CoValueCore::new(header)?;
        let account = *core.id();
        let account_actor = ActorId::Account(account);

        let mut node = Self {
            session: SessionId::new_random(account_actor),
            keyring: Keyring::new()
                .with(account_actor, agent.sealer.clone())
                .with(agent_actor, agent.sealer.clone()),
            agent,
            account,
            clock,
            co_values: HashMap::new(),
            privacy: HashMap::new(),
            changed: Vec::new(),
            subscriptions: HashMap::new(),
            next_subscription: 0,
        };
        node.insert_core(core);

        let bootstrap = SessionId::new_random(agent_actor);
        let signer = node.agent.signer.clone();
        node.write_as(
            &account,
            &bootstrap,
            &signer,
            vec![CoMap::set_op(&agent_actor.to_string(), json!(Role::Admin.as_str()))],
            Privacy::Trusting,
        )?;
        let state = node.group(&account)?;
        let recipient = Recipient {
            member: MemberKey::Actor(agent_actor),
            sealer: Some(node.agent.id().sealer),
        };
        let (_, _, changes) = rotation_changes(&state, None, &[recipient], &[])?;
        node.write_as(&account, &bootstrap, &signer, changes, Privacy::Trusting)?;

        info!(account = %account, "account created");
        Ok(node)
    }

    /// The account this node acts as.
    pub fn account_id(&self) -> &RawCoId {
        &self.account
    }

    /// The actor this node's edits are attributed to.
    pub fn actor(&self) -> ActorId {
        ActorId::Account(self.account)
    }

    pub fn agent(&self) -> &AgentSecret {
        &self.agent
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn has(&self, id: &RawCoId) -> bool {
        self.co_values.contains_key(id)
    }

    pub fn core(&self, id: &RawCoId) -> Result<&CoValueCore> {
        self.co_values.get(id).ok_or(NodeError::NotFound(*id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Write path
    // ─────────────────────────────────────────────────────────────────────────

    fn insert_core(&mut self, core: CoValueCore) {
        let id = *core.id();
        self.co_values.insert(id, core);
        self.record_change(&id);
    }

    /// Verify, admit and append. Every transaction enters the node here.
    fn add_transactions(
        &mut self,
        id: &RawCoId,
        session: &SessionId,
        after: u32,
        txs: &[Transaction],
        signature: Signature,
    ) -> std::result::Result<AppendOutcome, CoreError> {
        let Some(mut core) = self.co_values.remove(id) else {
            return Err(CoreError::MissingHeader(*id));
        };
        let outcome = core.try_add_transactions(
            &NodeAuthorizer::new(&self.co_values),
            session,
            after,
            txs,
            signature,
        );
        self.co_values.insert(*id, core);
        if let Ok(AppendOutcome::Appended { .. }) = outcome {
            self.record_change(id);
        }
        outcome
    }

    /// Id the next transaction of this node's session on `id` will get.
    fn next_tx_id(&self, id: &RawCoId) -> Result<TransactionId> {
        let core = self.core(id)?;
        Ok(TransactionId::new(
            self.session.clone(),
            core.next_tx_index(&self.session),
        ))
    }

    /// Build, sign and append one transaction in `session`.
    fn write_as(
        &mut self,
        id: &RawCoId,
        session: &SessionId,
        signer: &SignerSecret,
        changes: Vec<Value>,
        privacy: Privacy,
    ) -> Result<TransactionId> {
        let core = self.core(id)?;
        let made_at = self
            .clock
            .now_millis()
            .max(core.last_made_at(session).unwrap_or(i64::MIN));
        let tx_id = TransactionId::new(session.clone(), core.next_tx_index(session));
        let tx = match privacy {
            Privacy::Trusting => Transaction::trusting(made_at, &changes)?,
            Privacy::Private => {
                let (key_id, key) = self.write_key(core, session.actor())?;
                Transaction::private(made_at, &changes, key_id, &key, id, &tx_id)?
            }
        };
        let txs = [tx];
        let signature = core.sign_transactions(session, &txs, signer)?;
        self.add_transactions(id, session, tx_id.tx_index, &txs, signature)?;
        trace!(co_value = %id, tx = tx_id.tx_index, "wrote transaction");
        Ok(tx_id)
    }

    /// Write `changes` to `id` as this node's account.
    fn write(&mut self, id: &RawCoId, changes: Vec<Value>) -> Result<TransactionId> {
        let privacy = self.privacy_for(id)?;
        let session = self.session.clone();
        let signer = self.agent.signer.clone();
        self.write_as(id, &session, &signer, changes, privacy)
    }

    fn write_group(&mut self, id: &RawCoId, changes: Vec<Value>) -> Result<()> {
        let session = self.session.clone();
        let signer = self.agent.signer.clone();
        self.write_as(id, &session, &signer, changes, Privacy::Trusting)?;
        Ok(())
    }

    fn privacy_for(&self, id: &RawCoId) -> Result<Privacy> {
        if let Some(privacy) = self.privacy.get(id) {
            return Ok(*privacy);
        }
        let core = self.core(id)?;
        Ok(match core.header().owner() {
            Some(_) => Privacy::Private,
            None => Privacy::Trusting,
        })
    }

    /// Key for a private write by `author`: its write key if write-only,
    /// the current read key otherwise.
    fn write_key(&self, core: &CoValueCore, author: &ActorId) -> Result<(KeyId, KeySecret)> {
        let owner = core.header().owner().ok_or_else(|| {
            NodeError::InvalidOperation(format!(
                "{} has no owning group to encrypt for",
                core.id()
            ))
        })?;
        let group = self.group(owner)?;
        if group.role_of(author) == Some(Role::WriteOnly) {
            let key_id = group
                .write_key_for(author)
                .ok_or_else(|| NodeError::InvalidOperation(format!("{author} has no write key")))?;
            let key = resolve_key(&group, &key_id, &self.keyring)?;
            return Ok((key_id, key));
        }
        Ok(resolve_read_key(&group, &self.keyring)?)
    }

    fn record_change(&mut self, id: &RawCoId) {
        self.changed.push(*id);
        self.notify(id);

        let owned: Vec<RawCoId> = self
            .subscriptions
            .keys()
            .filter(|sub| {
                self.co_values
                    .get(sub)
                    .and_then(|core| core.header().owner())
                    == Some(id)
            })
            .copied()
            .collect();
        for dependent in owned {
            self.notify(&dependent);
        }
    }

    fn notify(&mut self, id: &RawCoId) {
        if !self.subscriptions.contains_key(id) {
            return;
        }
        let view = match self.view(id) {
            Ok(view) => view,
            Err(e) => {
                trace!(co_value = %id, error = %e, "nothing to notify");
                return;
            }
        };
        if let Some(listeners) = self.subscriptions.get_mut(id) {
            for (_, listener) in listeners.iter_mut() {
                listener(&view);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reading
    // ─────────────────────────────────────────────────────────────────────────

    /// Materialize `id`.
    pub fn view(&self, id: &RawCoId) -> Result<CoValueView> {
        let core = self.core(id)?;
        if core.header().is_group() {
            Ok(CoValueView::Group(GroupState::from_core(core)?))
        } else {
            Ok(CoValueView::Content(self.project(core)))
        }
    }

    /// Content of a non-group CoValue.
    pub fn content(&self, id: &RawCoId) -> Result<CoValueContent> {
        let core = self.core(id)?;
        if core.header().is_group() {
            return Err(NodeError::InvalidOperation(format!("{id} is a group")));
        }
        Ok(self.project(core))
    }

    /// Replayed state of a group or account.
    pub fn group(&self, id: &RawCoId) -> Result<GroupState> {
        let core = self.core(id)?;
        if !core.header().is_group() {
            return Err(NodeError::NotAGroup(*id));
        }
        Ok(GroupState::from_core(core)?)
    }

    fn project(&self, core: &CoValueCore) -> CoValueContent {
        let txs = self.decrypted_transactions(core);
        CoValueContent::project(*core.id(), core.header(), &txs)
    }

    /// Transactions of `core` this node can read, in causal order.
    ///
    /// Writes the owning group does not allow at their `madeAt` are
    /// skipped, as are private transactions whose key is unavailable.
    fn decrypted_transactions(&self, core: &CoValueCore) -> Vec<DecryptedTransaction> {
        let owner = match core.header().owner() {
            Some(group) => match self.co_values.get(group).map(GroupState::from_core) {
                Some(Ok(state)) => Some(state),
                Some(Err(e)) => {
                    warn!(co_value = %core.id(), error = %e, "owning group unreadable");
                    None
                }
                None => None,
            },
            None => None,
        };

        let mut keys: HashMap<KeyId, Option<KeySecret>> = HashMap::new();
        let mut out = Vec::new();
        for r in core.transactions_in_causal_order() {
            let author = *r.session_id.actor();
            if let Some(group) = &owner {
                if let Err(e) = group.check_owned_write(&author, r.tx) {
                    trace!(co_value = %core.id(), tx = ?r.tx_id(), error = %e, "skipping write");
                    continue;
                }
            }
            if let Some(changes) = self.read_changes(core, &r, owner.as_ref(), &mut keys) {
                out.push(DecryptedTransaction {
                    tx_id: r.tx_id(),
                    author,
                    made_at: r.tx.made_at(),
                    changes,
                });
            }
        }
        out
    }

    fn read_changes(
        &self,
        core: &CoValueCore,
        r: &TransactionRef<'_>,
        owner: Option<&GroupState>,
        keys: &mut HashMap<KeyId, Option<KeySecret>>,
    ) -> Option<Vec<Value>> {
        let parsed = match r.tx {
            Transaction::Trusting { .. } => r.tx.trusting_changes()?,
            Transaction::Private { key_used, .. } => {
                let key = keys
                    .entry(*key_used)
                    .or_insert_with(|| {
                        owner.and_then(|group| resolve_key(group, key_used, &self.keyring).ok())
                    })
                    .clone()?;
                r.tx.decrypt_changes(&key, core.id(), &r.tx_id())
            }
        };
        match parsed {
            Ok(changes) => Some(changes),
            Err(e) => {
                trace!(co_value = %core.id(), tx = ?r.tx_id(), error = %e, "unreadable transaction");
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creating CoValues
    // ─────────────────────────────────────────────────────────────────────────

    fn create_empty(&mut self, co_type: CoValueType, options: CreateOptions) -> Result<RawCoId> {
        let ruleset = match options.owner {
            Some(group) => {
                self.group(&group)?;
                Ruleset::OwnedByGroup { group }
            }
            None => Ruleset::UnsafeAllowAll,
        };
        let mut header = CoValueHeader::new(co_type, ruleset, self.clock.now_millis());
        if let Some(meta) = options.meta {
            header = header.with_meta(meta);
        }
        let core = CoValueCore::new(header)?;
        let id = *core.id();
        let privacy = match (options.owner, options.privacy) {
            (None, _) => Privacy::Trusting,
            (Some(_), Some(privacy)) => privacy,
            (Some(_), None) => Privacy::Private,
        };
        self.privacy.insert(id, privacy);
        self.insert_core(core);
        debug!(co_value = %id, co_type = co_type.as_str(), "created CoValue");
        Ok(id)
    }

    pub fn create_map(
        &mut self,
        options: CreateOptions,
        entries: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<RawCoId> {
        let id = self.create_empty(CoValueType::CoMap, options)?;
        let changes: Vec<Value> = entries
            .into_iter()
            .map(|(key, value)| CoMap::set_op(&key, value))
            .collect();
        if !changes.is_empty() {
            self.write(&id, changes)?;
        }
        Ok(id)
    }

    pub fn create_list(&mut self, options: CreateOptions, items: Vec<Value>) -> Result<RawCoId> {
        let id = self.create_empty(CoValueType::CoList, options)?;
        if !items.is_empty() {
            let tx = self.next_tx_id(&id)?;
            self.write(&id, CoList::insert_ops(None, items, &tx))?;
        }
        Ok(id)
    }

    pub fn create_stream(&mut self, options: CreateOptions) -> Result<RawCoId> {
        self.create_empty(CoValueType::CoStream, options)
    }

    /// A stream carrying one file, written with [`LocalNode::push_binary`].
    pub fn create_binary_stream(&mut self, options: CreateOptions) -> Result<RawCoId> {
        self.create_empty(
            CoValueType::CoStream,
            options.with_meta(json!({"type": "binary"})),
        )
    }

    pub fn create_plain_text(&mut self, options: CreateOptions, text: &str) -> Result<RawCoId> {
        let id = self.create_empty(CoValueType::CoPlainText, options)?;
        if !text.is_empty() {
            let tx = self.next_tx_id(&id)?;
            self.write(&id, CoPlainText::insert_ops(None, text, &tx))?;
        }
        Ok(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Editing
    // ─────────────────────────────────────────────────────────────────────────

    fn expect_type(&self, id: &RawCoId, co_type: CoValueType) -> Result<()> {
        let core = self.core(id)?;
        if core.header().co_type != co_type || core.header().is_group() {
            return Err(NodeError::InvalidOperation(format!(
                "{id} is not a {}",
                co_type.as_str()
            )));
        }
        Ok(())
    }

    fn list(&self, id: &RawCoId) -> Result<CoList> {
        self.expect_type(id, CoValueType::CoList)?;
        match self.content(id)? {
            CoValueContent::List(list) => Ok(list),
            _ => Err(NodeError::InvalidOperation(format!("{id} is not a list"))),
        }
    }

    fn plain_text(&self, id: &RawCoId) -> Result<CoPlainText> {
        self.expect_type(id, CoValueType::CoPlainText)?;
        match self.content(id)? {
            CoValueContent::PlainText(text) => Ok(text),
            _ => Err(NodeError::InvalidOperation(format!("{id} is not plain text"))),
        }
    }

    /// Set `key` of a map.
    pub fn set(&mut self, id: &RawCoId, key: &str, value: Value) -> Result<TransactionId> {
        self.expect_type(id, CoValueType::CoMap)?;
        self.write(id, vec![CoMap::set_op(key, value)])
    }

    /// Delete `key` of a map.
    pub fn delete(&mut self, id: &RawCoId, key: &str) -> Result<TransactionId> {
        self.expect_type(id, CoValueType::CoMap)?;
        self.write(id, vec![CoMap::del_op(key)])
    }

    /// Append to the end of a list.
    pub fn append(&mut self, id: &RawCoId, value: Value) -> Result<TransactionId> {
        let list = self.list(id)?;
        let tx = self.next_tx_id(id)?;
        self.write(id, CoList::insert_ops(list.last_op_id(), vec![value], &tx))
    }

    /// Insert into a list so the value ends up at `index`.
    pub fn insert(&mut self, id: &RawCoId, index: usize, value: Value) -> Result<TransactionId> {
        let list = self.list(id)?;
        if index > list.len() {
            return Err(NodeError::InvalidOperation(format!(
                "index {index} out of bounds for list of {}",
                list.len()
            )));
        }
        let after = index.checked_sub(1).and_then(|i| list.op_id_at(i));
        let tx = self.next_tx_id(id)?;
        self.write(id, CoList::insert_ops(after, vec![value], &tx))
    }

    /// Delete the list element at `index`.
    pub fn remove(&mut self, id: &RawCoId, index: usize) -> Result<TransactionId> {
        let list = self.list(id)?;
        let op = list.op_id_at(index).ok_or_else(|| {
            NodeError::InvalidOperation(format!("index {index} out of bounds"))
        })?;
        self.write(id, vec![CoList::delete_op(op)])
    }

    /// Push an item to this session's feed of a stream.
    pub fn push_item(&mut self, id: &RawCoId, value: Value) -> Result<TransactionId> {
        self.expect_type(id, CoValueType::CoStream)?;
        self.write(id, vec![value])
    }

    /// Write `data` as the content of a binary stream.
    pub fn push_binary(
        &mut self,
        id: &RawCoId,
        mime_type: &str,
        file_name: Option<&str>,
        data: &[u8],
        chunk_size: usize,
    ) -> Result<TransactionId> {
        if !self.core(id)?.header().is_binary_stream() {
            return Err(NodeError::InvalidOperation(format!("{id} is not a binary stream")));
        }
        self.write(id, CoStream::binary_items(mime_type, file_name, data, chunk_size))
    }

    /// Insert `text` so it starts at character `index`.
    pub fn insert_text(&mut self, id: &RawCoId, index: usize, text: &str) -> Result<TransactionId> {
        let current = self.plain_text(id)?;
        if index > current.len() {
            return Err(NodeError::InvalidOperation(format!(
                "index {index} out of bounds for text of {}",
                current.len()
            )));
        }
        let after = index.checked_sub(1).and_then(|i| current.op_id_at(i));
        let tx = self.next_tx_id(id)?;
        self.write(id, CoPlainText::insert_ops(after, text, &tx))
    }

    pub fn delete_text(&mut self, id: &RawCoId, range: Range<usize>) -> Result<TransactionId> {
        let current = self.plain_text(id)?;
        let changes = current.delete_ops(range);
        if changes.is_empty() {
            return Err(NodeError::InvalidOperation("nothing to delete".into()));
        }
        self.write(id, changes)
    }

    /// Mark a character range with `tag`.
    pub fn mark(
        &mut self,
        id: &RawCoId,
        range: Range<usize>,
        tag: &str,
        attrs: Value,
    ) -> Result<TransactionId> {
        let current = self.plain_text(id)?;
        let change = current.mark_op(range.clone(), tag, attrs).ok_or_else(|| {
            NodeError::InvalidOperation(format!("cannot mark {range:?}"))
        })?;
        self.write(id, vec![change])
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a group administered by this account.
    pub fn create_group(&mut self) -> Result<RawCoId> {
        let me = self.actor();
        let header = CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::Group { initial_admin: me },
            self.clock.now_millis(),
        );
        let core = CoValueCore::new(header)?;
        let id = *core.id();
        self.insert_core(core);

        self.write_group(&id, vec![CoMap::set_op(&me.to_string(), json!(Role::Admin.as_str()))])?;
        let state = self.group(&id)?;
        let recipient = Recipient {
            member: MemberKey::Actor(me),
            sealer: Some(self.agent.id().sealer),
        };
        let (_, _, changes) = rotation_changes(&state, None, &[recipient], &[])?;
        self.write_group(&id, changes)?;

        debug!(group = %id, "created group");
        Ok(id)
    }

    /// Sealer reveals to `member` are encrypted for. Accounts must be held
    /// by this node.
    fn sealer_of(&self, member: &MemberKey) -> Result<Option<SealerId>> {
        match member {
            MemberKey::Everyone => Ok(None),
            MemberKey::Actor(ActorId::Agent(agent)) => Ok(Some(agent.sealer)),
            MemberKey::Actor(ActorId::Account(account)) => {
                let state = self.group(account)?;
                state
                    .admin_agents()
                    .first()
                    .map(|agent| Some(agent.sealer))
                    .ok_or_else(|| {
                        NodeError::InvalidOperation(format!("account {account} has no agent"))
                    })
            }
        }
    }

    /// Give `member` a role in `group`, revealing the keys the role needs.
    ///
    /// Lowering an existing role rotates the read key.
    pub fn add_member(&mut self, group: &RawCoId, member: MemberKey, role: Role) -> Result<()> {
        if role.is_invite() {
            return Err(NodeError::InvalidOperation(format!(
                "{role} is only granted through invites"
            )));
        }
        let state = self.group(group)?;
        let previous = state.explicit_role(&member);

        let mut changes = vec![CoMap::set_op(&member.to_string(), json!(role.as_str()))];
        if role.can_read() {
            let (key_id, key) = resolve_read_key(&state, &self.keyring)?;
            let sealer = self.sealer_of(&member)?;
            changes.push(reveal_change(&state, &key_id, &key, &member, sealer.as_ref())?);
        } else if role == Role::WriteOnly {
            if let MemberKey::Actor(actor) = &member {
                let (read_id, read_key) = resolve_read_key(&state, &self.keyring)?;
                let write_id = KeyId::generate();
                let write_key = KeySecret::generate();
                let sealer = self.sealer_of(&member)?;
                changes.push(CoMap::set_op(
                    &GroupKey::write_key_for(actor),
                    json!(write_id.to_string()),
                ));
                changes.push(reveal_change(&state, &write_id, &write_key, &member, sealer.as_ref())?);
                changes.push(envelope_change(write_id, &write_key, read_id, &read_key)?);
            }
        }
        self.write_group(group, changes)?;
        info!(group = %group, member = %member, role = %role, "member role set");

        if previous.is_some_and(|previous| role.rank() < previous.rank()) {
            self.rotate_read_key(group)?;
        }
        Ok(())
    }

    /// Revoke `member`, rotating the read key.
    pub fn remove_member(&mut self, group: &RawCoId, member: MemberKey) -> Result<()> {
        self.add_member(group, member, Role::Revoked)
    }

    /// Replace the read key of `group`, revealing the new one to everyone
    /// who may still read.
    pub fn rotate_read_key(&mut self, group: &RawCoId) -> Result<KeyId> {
        let state = self.group(group)?;
        let previous = resolve_read_key(&state, &self.keyring)?;

        let mut recipients = Vec::new();
        for member in read_key_recipients(&state) {
            let sealer = self.sealer_of(&member)?;
            recipients.push(Recipient { member, sealer });
        }

        let mut write_keys = Vec::new();
        for (member, role) in state.members() {
            let MemberKey::Actor(actor) = member else {
                continue;
            };
            if !matches!(role, Role::WriteOnly | Role::WriteOnlyInvite) {
                continue;
            }
            let Some(write_id) = state.write_key_for(actor) else {
                continue;
            };
            match resolve_key(&state, &write_id, &self.keyring) {
                Ok(key) => write_keys.push((write_id, key)),
                Err(e) => warn!(group = %group, member = %actor, error = %e, "write key not carried over"),
            }
        }

        let (key_id, _, changes) = rotation_changes(&state, Some(previous), &recipients, &write_keys)?;
        self.write_group(group, changes)?;
        info!(group = %group, key = %key_id, "rotated read key");
        Ok(key_id)
    }

    /// Create an invite granting `role`. The secret is shared out of band.
    pub fn create_invite(&mut self, group: &RawCoId, role: Role) -> Result<InviteSecret> {
        let state = self.group(group)?;
        let secret = InviteSecret::generate();
        let changes = create_invite_changes(&state, &self.keyring, role, &secret)?;
        self.write_group(group, changes)?;
        debug!(group = %group, role = %role, "created invite");
        Ok(secret)
    }

    /// Join `group` with an invite. The group must be held by this node.
    pub fn accept_invite(&mut self, group: &RawCoId, secret: &InviteSecret) -> Result<()> {
        let state = self.group(group)?;
        let me = self.actor();
        let changes = accept_invite_changes(&state, secret, &me, &self.agent.id().sealer)?;
        let invite_agent = secret.agent();
        let session = SessionId::new_random(secret.actor());
        self.write_as(group, &session, &invite_agent.signer, changes, Privacy::Trusting)?;
        info!(group = %group, "accepted invite");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Call `listener` with the current view of `id`, if held, and after
    /// every change to it or its owning group.
    pub fn subscribe(
        &mut self,
        id: &RawCoId,
        listener: impl FnMut(&CoValueView) + Send + 'static,
    ) -> SubscriptionId {
        let subscription = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions
            .entry(*id)
            .or_default()
            .push((subscription, Box::new(listener)));
        self.notify(id);
        subscription
    }

    pub fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        let mut found = false;
        for listeners in self.subscriptions.values_mut() {
            let before = listeners.len();
            listeners.retain(|(id, _)| *id != subscription);
            found |= listeners.len() != before;
        }
        self.subscriptions.retain(|_, listeners| !listeners.is_empty());
        found
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync surface
    // ─────────────────────────────────────────────────────────────────────────

    pub fn known_state(&self, id: &RawCoId) -> Option<CoValueKnownState> {
        self.co_values.get(id).map(CoValueCore::known_state)
    }

    pub fn new_content_since(
        &self,
        id: &RawCoId,
        known: Option<&CoValueKnownState>,
    ) -> Option<Vec<NewContentPiece>> {
        self.co_values.get(id)?.new_content_since(known)
    }

    /// CoValues a peer needs before it can check `id`: the owning group
    /// and the accounts that authored sessions, transitively, each listed
    /// after its own dependencies.
    pub fn dependencies(&self, id: &RawCoId) -> Vec<RawCoId> {
        let mut out = Vec::new();
        let mut visiting = HashSet::new();
        self.collect_dependencies(id, &mut out, &mut visiting);
        out
    }

    fn collect_dependencies(
        &self,
        id: &RawCoId,
        out: &mut Vec<RawCoId>,
        visiting: &mut HashSet<RawCoId>,
    ) {
        let Some(core) = self.co_values.get(id) else {
            return;
        };
        if !visiting.insert(*id) {
            return;
        }
        let mut direct: Vec<RawCoId> = core.header().owner().copied().into_iter().collect();
        direct.extend(core.authors().iter().filter_map(ActorId::as_account).copied());
        for dependency in direct {
            if dependency == *id || out.contains(&dependency) {
                continue;
            }
            self.collect_dependencies(&dependency, out, visiting);
            if self.co_values.contains_key(&dependency) && !out.contains(&dependency) {
                out.push(dependency);
            }
        }
    }

    /// Accounts authoring sessions in `piece` that this node lacks.
    fn missing_author(&self, piece: &NewContentPiece) -> Option<RawCoId> {
        piece
            .new
            .keys()
            .filter_map(|session| session.actor().as_account())
            .find(|account| **account != piece.id && !self.co_values.contains_key(account))
            .copied()
    }
}

impl SyncHost for LocalNode {
    fn co_value_ids(&self) -> Vec<RawCoId> {
        self.co_values.keys().copied().collect()
    }

    fn known_state(&self, id: &RawCoId) -> Option<CoValueKnownState> {
        LocalNode::known_state(self, id)
    }

    fn new_content_since(
        &self,
        id: &RawCoId,
        known: Option<&CoValueKnownState>,
    ) -> Option<Vec<NewContentPiece>> {
        LocalNode::new_content_since(self, id, known)
    }

    fn dependencies(&self, id: &RawCoId) -> Vec<RawCoId> {
        LocalNode::dependencies(self, id)
    }

    fn apply_content(&mut self, piece: &NewContentPiece) -> ApplyReport {
        let held = self.co_values.contains_key(&piece.id);
        if !held && piece.header.is_none() {
            return ApplyReport::correction();
        }
        if let Some(account) = self.missing_author(piece) {
            return ApplyReport::missing(account);
        }
        if !held {
            let Some(header) = piece.header.clone() else {
                return ApplyReport::correction();
            };
            if let Some(owner) = header.owner() {
                if !self.co_values.contains_key(owner) {
                    return ApplyReport::missing(*owner);
                }
            }
            match CoValueCore::from_received(piece.id, header) {
                Ok(core) => self.insert_core(core),
                Err(e) => {
                    warn!(co_value = %piece.id, error = %e, "ignoring CoValue with mismatched header");
                    return ApplyReport::default();
                }
            }
        }

        let mut report = ApplyReport::default();
        for (session, content) in &piece.new {
            match self.add_transactions(
                &piece.id,
                session,
                content.after,
                &content.new_transactions,
                content.last_signature,
            ) {
                Ok(AppendOutcome::Appended { count }) => report.applied += count,
                Ok(AppendOutcome::Duplicate) => {}
                Err(CoreError::MissingDependency(dependency)) => {
                    report.missing_dependency = Some(dependency);
                    return report;
                }
                Err(e) if e.needs_correction() => report.needs_correction = true,
                Err(e) => {
                    warn!(co_value = %piece.id, session = %session, error = %e, "rejected transactions");
                    report.rejected.push((session.clone(), e));
                }
            }
        }
        report
    }

    fn take_changed(&mut self) -> Vec<RawCoId> {
        let mut seen = HashSet::new();
        let mut changed = std::mem::take(&mut self.changed);
        changed.retain(|id| seen.insert(*id));
        changed
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("account", &self.account)
            .field("session", &self.session)
            .field("co_values", &self.co_values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojson_core::ManualClock;
    use std::sync::Mutex;

    fn node() -> LocalNode {
        LocalNode::create_account(ManualClock::new(1_000)).unwrap()
    }

    #[test]
    fn test_account_is_a_group_with_its_agent_as_admin() {
        let node = node();
        let account = node.group(node.account_id()).unwrap();
        assert!(node.core(node.account_id()).unwrap().header().is_account());
        assert_eq!(account.admin_agents(), vec![node.agent().id()]);
        assert!(account.read_key_id().is_some());
    }

    #[test]
    fn test_owned_map_round_trip() {
        let mut node = node();
        let group = node.create_group().unwrap();
        let map = node
            .create_map(
                CreateOptions::owned_by(group),
                [("title".to_string(), json!("hello"))],
            )
            .unwrap();
        node.set(&map, "count", json!(1)).unwrap();

        let content = node.content(&map).unwrap();
        assert_eq!(content.to_json(), json!({"title": "hello", "count": 1}));

        let core = node.core(&map).unwrap();
        let privacies: Vec<Privacy> = core
            .transactions_in_causal_order()
            .iter()
            .map(|r| r.tx.privacy())
            .collect();
        assert_eq!(privacies, vec![Privacy::Private, Privacy::Private]);
    }

    #[test]
    fn test_trusting_option_writes_plaintext() {
        let mut node = node();
        let group = node.create_group().unwrap();
        let map = node
            .create_map(CreateOptions::owned_by(group).trusting(), Vec::new())
            .unwrap();
        node.set(&map, "k", json!("v")).unwrap();
        let core = node.core(&map).unwrap();
        assert_eq!(
            core.transactions_in_causal_order()[0].tx.privacy(),
            Privacy::Trusting
        );
    }

    #[test]
    fn test_list_editing() {
        let mut node = node();
        let list = node
            .create_list(CreateOptions::default(), vec![json!("a"), json!("c")])
            .unwrap();
        node.insert(&list, 1, json!("b")).unwrap();
        node.append(&list, json!("d")).unwrap();
        node.insert(&list, 0, json!("start")).unwrap();
        node.remove(&list, 2).unwrap();

        assert_eq!(
            node.content(&list).unwrap().to_json(),
            json!(["start", "a", "c", "d"])
        );
        assert!(node.insert(&list, 10, json!("x")).is_err());
    }

    #[test]
    fn test_plain_text_editing() {
        let mut node = node();
        let text = node
            .create_plain_text(CreateOptions::default(), "hello")
            .unwrap();
        node.insert_text(&text, 5, " world").unwrap();
        node.delete_text(&text, 0..1).unwrap();
        node.insert_text(&text, 0, "H").unwrap();
        node.mark(&text, 0..5, "strong", json!({})).unwrap();

        let content = node.content(&text).unwrap();
        let text = content.as_plain_text().unwrap();
        assert_eq!(text.text(), "Hello world");
        assert_eq!(text.marks().len(), 1);
    }

    #[test]
    fn test_binary_stream() {
        let mut node = node();
        let stream = node.create_binary_stream(CreateOptions::default()).unwrap();
        node.push_binary(&stream, "text/plain", Some("a.txt"), b"abcdef", 4)
            .unwrap();

        let content = node.content(&stream).unwrap();
        let binary = content.as_stream().unwrap().binary().unwrap();
        assert_eq!(binary.data, b"abcdef");
        assert!(binary.finished);

        let plain = node.create_stream(CreateOptions::default()).unwrap();
        assert!(node.push_binary(&plain, "text/plain", None, b"x", 1).is_err());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let mut node = node();
        let list = node.create_list(CreateOptions::default(), Vec::new()).unwrap();
        assert!(matches!(
            node.set(&list, "k", json!(1)),
            Err(NodeError::InvalidOperation(_))
        ));
        assert!(matches!(node.group(&list), Err(NodeError::NotAGroup(_))));
    }

    #[test]
    fn test_made_at_never_goes_backwards() {
        let clock = ManualClock::new(5_000);
        let mut node = LocalNode::create_account(clock.clone()).unwrap();
        let map = node.create_map(CreateOptions::default(), Vec::new()).unwrap();
        node.set(&map, "a", json!(1)).unwrap();
        clock.set(1_000);
        node.set(&map, "b", json!(2)).unwrap();

        let core = node.core(&map).unwrap();
        let made: Vec<i64> = core
            .transactions_in_causal_order()
            .iter()
            .map(|r| r.tx.made_at())
            .collect();
        assert_eq!(made, vec![5_000, 5_000]);
    }

    #[test]
    fn test_subscribers_see_every_change() {
        let mut node = node();
        let map = node.create_map(CreateOptions::default(), Vec::new()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = node.subscribe(&map, move |view| {
            sink.lock().unwrap().push(view.to_json());
        });

        node.set(&map, "a", json!(1)).unwrap();
        assert!(node.unsubscribe(subscription));
        node.set(&map, "b", json!(2)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!({}), json!({"a": 1})]);
    }

    #[test]
    fn test_dependencies_list_owner_and_authors() {
        let mut node = node();
        let group = node.create_group().unwrap();
        let map = node
            .create_map(CreateOptions::owned_by(group), [("k".to_string(), json!(1))])
            .unwrap();

        let account = *node.account_id();
        assert_eq!(node.dependencies(&map), vec![account, group]);
        assert_eq!(node.dependencies(&group), vec![account]);
        assert!(node.dependencies(&account).is_empty());
    }

    #[test]
    fn test_apply_content_from_another_node() {
        let mut a = node();
        let mut b = node();
        let group = a.create_group().unwrap();
        a.add_member(&group, MemberKey::Everyone, Role::Reader).unwrap();
        let map = a
            .create_map(CreateOptions::owned_by(group), [("k".to_string(), json!("v"))])
            .unwrap();

        let map_pieces = a.new_content_since(&map, None).unwrap();
        assert_eq!(
            b.apply_content(&map_pieces[0]).missing_dependency,
            Some(*a.account_id())
        );

        for id in a.dependencies(&map) {
            for piece in a.new_content_since(&id, None).unwrap() {
                let report = b.apply_content(&piece);
                assert!(report.rejected.is_empty());
            }
        }
        for piece in &map_pieces {
            assert_eq!(b.apply_content(piece).applied, 1);
        }
        assert_eq!(b.content(&map).unwrap().to_json(), json!({"k": "v"}));

        let again = b.apply_content(&map_pieces[0]);
        assert_eq!(again.applied, 0);
        assert!(again.rejected.is_empty());
    }

    #[test]
    fn test_content_without_header_needs_correction() {
        let mut a = node();
        let mut b = node();
        let map = a
            .create_map(CreateOptions::default(), [("k".to_string(), json!(1))])
            .unwrap();
        let known = CoValueKnownState {
            header: true,
            ..CoValueKnownState::empty(map)
        };
        let pieces = a.new_content_since(&map, Some(&known)).unwrap();
        assert!(b.apply_content(&pieces[0]).needs_correction);
    }
}
