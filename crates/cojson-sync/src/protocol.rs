//! Sync protocol state machine.
//!
//! [`SyncManager`] keeps, per peer and per CoValue, what the peer is
//! believed to have and reacts to incoming messages by diffing against
//! that belief. It never touches CoValues directly: the node is reached
//! through [`SyncHost`], so everything that enters the node goes through
//! the node's single write path before it is relayed anywhere.
//!
//! Per (peer, CoValue) the phase moves `unknown → pulling → synced`. A
//! report that claims less than previously believed resets the belief and
//! the content is re-diffed from the lower baseline.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use cojson_core::{
    Clock, CoValueKnownState, CoreError, NewContentPiece, Priority, RawCoId, SessionId,
};

use crate::codec::{decode_frame, encode_message, Frame};
use crate::error::{Result, SyncError};
use crate::messages::{KnownMessage, PeerId, SyncMessage};
use crate::peer::{PeerConfig, PeerEntry, PeerKnownState, SyncPhase};
use crate::queue::{OutgoingQueue, QueueConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Configuration for sync behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub queue: QueueConfig,
    /// Interval between keepalive pings.
    pub ping_interval_ms: u64,
    /// A peer silent for this long is closed.
    pub ping_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            ping_interval_ms: 10_000,
            ping_timeout_ms: 30_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host
// ─────────────────────────────────────────────────────────────────────────────

/// What applying a content piece did.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Transactions appended.
    pub applied: usize,
    /// A CoValue that must be present before the piece can be checked.
    pub missing_dependency: Option<RawCoId>,
    /// The piece does not fit what we have: no header, or a gap.
    pub needs_correction: bool,
    /// Session batches that were rejected.
    pub rejected: Vec<(SessionId, CoreError)>,
}

impl ApplyReport {
    pub fn missing(dependency: RawCoId) -> Self {
        Self {
            missing_dependency: Some(dependency),
            ..Self::default()
        }
    }

    pub fn correction() -> Self {
        Self {
            needs_correction: true,
            ..Self::default()
        }
    }
}

/// The node as seen by the protocol.
pub trait SyncHost {
    /// Every CoValue the host holds.
    fn co_value_ids(&self) -> Vec<RawCoId>;

    /// What the host has of `id`, or `None` if it has nothing.
    fn known_state(&self, id: &RawCoId) -> Option<CoValueKnownState>;

    /// Content a peer with `known` is missing.
    fn new_content_since(
        &self,
        id: &RawCoId,
        known: Option<&CoValueKnownState>,
    ) -> Option<Vec<NewContentPiece>>;

    /// CoValues needed to validate `id`, dependencies of dependencies first.
    fn dependencies(&self, id: &RawCoId) -> Vec<RawCoId>;

    /// Verify and apply a piece through the host's write path.
    fn apply_content(&mut self, piece: &NewContentPiece) -> ApplyReport;

    /// CoValues changed since the last call.
    fn take_changed(&mut self) -> Vec<RawCoId>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Loads
// ─────────────────────────────────────────────────────────────────────────────

/// Progress of a `load`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loading,
    Available,
    /// Every asked peer answered that it does not have the CoValue.
    Unavailable,
}

#[derive(Debug)]
struct LoadState {
    candidates: VecDeque<PeerId>,
    asked: Option<PeerId>,
    status: LoadStatus,
}

#[derive(Clone, Copy)]
enum Reply {
    Data,
    Push,
}

enum Applied {
    Ok,
    Deferred,
    Corrected,
    Rejected,
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol state for all peers of a node.
pub struct SyncManager {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    peers: BTreeMap<PeerId, PeerEntry>,
    loads: HashMap<RawCoId, LoadState>,
    /// Messages waiting for a dependency, keyed by the dependency.
    waiting: HashMap<RawCoId, Vec<(PeerId, SyncMessage)>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            peers: BTreeMap::new(),
            loads: HashMap::new(),
            waiting: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a peer. Server and storage peers are asked about every
    /// CoValue the host holds. Re-adding an id replaces the old entry.
    pub fn add_peer(&mut self, host: &dyn SyncHost, config: PeerConfig) -> Arc<OutgoingQueue> {
        let id = config.id.clone();
        let entry = PeerEntry::new(config, self.config.queue.clone(), self.clock.clone());
        let queue = entry.queue.clone();
        if let Some(old) = self.peers.insert(id.clone(), entry) {
            old.queue.close();
        }
        debug!(peer = %id, "peer added");

        if self.peers.get(&id).is_some_and(|p| p.role().receives_all()) {
            for co_id in host.co_value_ids() {
                if let Some(known_state) = host.known_state(&co_id) {
                    self.mark_pulling(&id, &co_id);
                    self.send(&id, SyncMessage::Pull { known_state });
                }
            }
        }
        queue
    }

    /// Close and forget a peer. Its queued sends resolve as dropped and
    /// loads waiting on it move on.
    pub fn close_peer(&mut self, host: &dyn SyncHost, id: &PeerId) -> Option<PeerConfig> {
        let mut entry = self.peers.remove(id)?;
        entry.closed = true;
        entry.queue.close();
        debug!(peer = %id, "peer closed");

        for waiting in self.waiting.values_mut() {
            waiting.retain(|(peer, _)| peer != id);
        }
        self.waiting.retain(|_, w| !w.is_empty());

        let stalled: Vec<RawCoId> = self
            .loads
            .iter_mut()
            .filter_map(|(co_id, load)| {
                load.candidates.retain(|c| c != id);
                (load.asked.as_ref() == Some(id)).then_some(*co_id)
            })
            .collect();
        for co_id in stalled {
            self.ask_next(host, &co_id);
        }
        Some(entry.config)
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    /// What we believe `peer` has of `id`.
    pub fn peer_known_state(&self, peer: &PeerId, id: &RawCoId) -> Option<&PeerKnownState> {
        self.peers.get(peer)?.known.get(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming
    // ─────────────────────────────────────────────────────────────────────────

    /// Decode a frame from `from` and handle every message in it.
    pub fn handle_frame(
        &mut self,
        host: &mut dyn SyncHost,
        from: &PeerId,
        frame: &[u8],
    ) -> Result<()> {
        for line in decode_frame(frame) {
            match line {
                Frame::Message(message) => self.handle_message(host, from, message)?,
                Frame::Ping => trace!(peer = %from, "ping"),
            }
        }
        Ok(())
    }

    /// Handle one message from `from`, then relay whatever changed.
    pub fn handle_message(
        &mut self,
        host: &mut dyn SyncHost,
        from: &PeerId,
        message: SyncMessage,
    ) -> Result<()> {
        let dialect = self
            .peers
            .get(from)
            .map(|p| p.config.dialect)
            .ok_or_else(|| SyncError::UnknownPeer(from.to_string()))?;
        let Some(message) = dialect.incoming(message) else {
            return Ok(());
        };
        self.dispatch(host, from, message);
        self.refresh_loads(host);
        self.sync_changes(host);
        Ok(())
    }

    fn dispatch(&mut self, host: &mut dyn SyncHost, from: &PeerId, message: SyncMessage) {
        trace!(peer = %from, id = %message.id(), action = message.action(), "handling message");
        match message {
            SyncMessage::Pull { known_state } => self.handle_pull(host, from, known_state),
            SyncMessage::Push { .. } => self.handle_push(host, from, message),
            SyncMessage::Data { .. } => self.handle_data(host, from, message),
            SyncMessage::Ack { known_state } => {
                if let Some(peer) = self.peers.get_mut(from) {
                    let state = peer.known_mut(&known_state.id);
                    state.record_confirmed(&known_state);
                    state.phase = SyncPhase::Synced;
                }
            }
            SyncMessage::Known(known) => self.handle_known(host, from, known),
            SyncMessage::Load(_) | SyncMessage::Content(_) | SyncMessage::Done { .. } => {
                trace!(peer = %from, "ignoring unnormalized legacy message")
            }
        }
    }

    fn handle_pull(&mut self, host: &mut dyn SyncHost, from: &PeerId, theirs: CoValueKnownState) {
        let id = theirs.id;
        self.record_report(host, from, &theirs);

        let Some(ours) = host.known_state(&id) else {
            self.send(
                from,
                SyncMessage::Data {
                    known_state: CoValueKnownState::empty(id),
                    known: false,
                    content: None,
                },
            );
            if theirs.header {
                self.mark_pulling(from, &id);
                self.send(
                    from,
                    SyncMessage::Pull {
                        known_state: CoValueKnownState::empty(id),
                    },
                );
            }
            return;
        };

        if !self.send_with_dependencies(host, from, &id, Reply::Data) {
            self.send(
                from,
                SyncMessage::Data {
                    known_state: ours.clone(),
                    known: true,
                    content: None,
                },
            );
        }
        if let Some(peer) = self.peers.get_mut(from) {
            peer.known_mut(&id).phase = SyncPhase::Synced;
        }

        if !ours.covers(&theirs) {
            self.mark_pulling(from, &id);
            self.send(from, SyncMessage::Pull { known_state: ours });
        }
    }

    fn handle_push(&mut self, host: &mut dyn SyncHost, from: &PeerId, message: SyncMessage) {
        let SyncMessage::Push {
            known_state,
            content,
        } = &message
        else {
            return;
        };
        let id = content.id;
        if let Some(peer) = self.peers.get_mut(from) {
            peer.known_mut(&id).record_confirmed(known_state);
        }

        let outcome = self.apply(host, from, &message);
        if let Applied::Ok = outcome {
            if let Some(ours) = host.known_state(&id) {
                self.send(from, SyncMessage::Ack { known_state: ours });
            }
            // Anything they lack that we have goes back to them.
            self.send_with_dependencies(host, from, &id, Reply::Push);
        }
    }

    fn handle_data(&mut self, host: &mut dyn SyncHost, from: &PeerId, message: SyncMessage) {
        let SyncMessage::Data {
            known_state,
            known,
            content,
        } = &message
        else {
            return;
        };
        let id = known_state.id;

        if !known {
            debug!(peer = %from, id = %id, "peer does not have CoValue");
            if let Some(peer) = self.peers.get_mut(from) {
                peer.known_mut(&id).phase = SyncPhase::Unavailable;
            }
            self.load_missed(host, from, &id);
            return;
        }

        self.record_report(host, from, known_state);
        let outcome = match content {
            Some(_) => self.apply(host, from, &message),
            None => Applied::Ok,
        };
        if let (Applied::Ok, Some(peer)) = (outcome, self.peers.get_mut(from)) {
            peer.known_mut(&id).phase = SyncPhase::Synced;
        }
    }

    fn handle_known(&mut self, host: &mut dyn SyncHost, from: &PeerId, known: KnownMessage) {
        let theirs = known.known_state();
        let id = theirs.id;

        let loading_from_them = self
            .loads
            .get(&id)
            .is_some_and(|l| l.asked.as_ref() == Some(from));
        if !theirs.header && !known.is_correction && loading_from_them {
            self.load_missed(host, from, &id);
            return;
        }

        let corrected = self.record_report(host, from, &theirs);
        if known.is_correction && !corrected {
            debug!(peer = %from, id = %id, "peer sent correction");
            if let Some(peer) = self.peers.get_mut(from) {
                let state = peer.known_mut(&id);
                state.optimistic = Some(theirs.clone());
                state.confirmed = Some(theirs.clone());
            }
            self.send_with_dependencies(host, from, &id, Reply::Push);
        }

        if let Some(ours) = host.known_state(&id) {
            if !ours.covers(&theirs) {
                self.mark_pulling(from, &id);
                self.send(from, SyncMessage::Pull { known_state: ours });
            } else {
                self.send_diff(host, from, &id, Reply::Push);
            }
        }
    }

    /// Record an authoritative report. Returns whether it regressed; the
    /// content is then re-diffed from the reported baseline.
    fn record_report(
        &mut self,
        host: &dyn SyncHost,
        from: &PeerId,
        theirs: &CoValueKnownState,
    ) -> bool {
        let Some(peer) = self.peers.get_mut(from) else {
            return false;
        };
        let reported = peer.known_mut(&theirs.id).record_reported(from, theirs);
        match reported {
            Ok(()) => false,
            Err(e) => {
                debug!(error = %e, "re-diffing from corrected known state");
                self.send_with_dependencies(host, from, &theirs.id, Reply::Push);
                true
            }
        }
    }

    /// Run a piece through the host. Content that is invalid is logged and
    /// otherwise ignored.
    fn apply(&mut self, host: &mut dyn SyncHost, from: &PeerId, message: &SyncMessage) -> Applied {
        let Some(piece) = message.content() else {
            return Applied::Ok;
        };
        let id = piece.id;
        let report = host.apply_content(piece);

        if let Some(dependency) = report.missing_dependency {
            debug!(peer = %from, id = %id, dependency = %dependency, "waiting for dependency");
            self.waiting
                .entry(dependency)
                .or_default()
                .push((from.clone(), message.clone()));
            let already_pulling = self
                .peers
                .get(from)
                .is_some_and(|p| p.phase(&dependency) == SyncPhase::Pulling);
            if !already_pulling {
                let known_state = host
                    .known_state(&dependency)
                    .unwrap_or_else(|| CoValueKnownState::empty(dependency));
                self.mark_pulling(from, &dependency);
                self.send(from, SyncMessage::Pull { known_state });
            }
            return Applied::Deferred;
        }

        if report.needs_correction {
            let ours = host
                .known_state(&id)
                .unwrap_or_else(|| CoValueKnownState::empty(id));
            debug!(peer = %from, id = %id, "content does not fit, sending correction");
            self.send(from, SyncMessage::Known(KnownMessage::correction(ours)));
            return Applied::Corrected;
        }

        let sent = piece.known_state_after();
        if let Some(peer) = self.peers.get_mut(from) {
            peer.known_mut(&id).record_confirmed(&sent);
        }
        if host.known_state(&id).is_some() {
            self.retry_waiting(host, &id);
        }

        if report.rejected.is_empty() {
            trace!(peer = %from, id = %id, applied = report.applied, "content applied");
            return Applied::Ok;
        }
        for (session, error) in &report.rejected {
            warn!(peer = %from, id = %id, session = %session, error = %error, "rejected transactions");
        }
        Applied::Rejected
    }

    fn retry_waiting(&mut self, host: &mut dyn SyncHost, dependency: &RawCoId) {
        let Some(waiting) = self.waiting.remove(dependency) else {
            return;
        };
        for (peer, message) in waiting {
            if self.peers.contains_key(&peer) {
                trace!(peer = %peer, id = %message.id(), "retrying after dependency");
                self.dispatch(host, &peer, message);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outgoing
    // ─────────────────────────────────────────────────────────────────────────

    /// Relay every CoValue the host changed: to all server, mesh and
    /// storage peers, and to clients that have shown interest in it.
    pub fn sync_changes(&mut self, host: &mut dyn SyncHost) {
        for id in host.take_changed() {
            let targets: Vec<PeerId> = self
                .peers
                .values()
                .filter(|p| !p.closed && (p.role().receives_all() || p.known.contains_key(&id)))
                .map(|p| p.id().clone())
                .collect();
            for peer in targets {
                self.send_with_dependencies(host, &peer, &id, Reply::Push);
            }
        }
    }

    /// Queue what `peer` lacks of `id` and of everything `id` depends on.
    /// The whole unit goes out at the least urgent priority among its
    /// pieces, so dependencies leave the queue before the content that
    /// needs them. Returns whether anything of `id` itself was queued.
    fn send_with_dependencies(
        &mut self,
        host: &dyn SyncHost,
        peer: &PeerId,
        id: &RawCoId,
        reply: Reply,
    ) -> bool {
        let mut unit = Vec::new();
        for dependency in host.dependencies(id) {
            unit.extend(self.diff(host, peer, &dependency, reply));
        }
        let own = self.diff(host, peer, id, reply);
        let sent_own = !own.is_empty();
        unit.extend(own);

        let Some(priority) = unit.iter().map(SyncMessage::priority).max() else {
            return false;
        };
        if let Some(entry) = self.peers.get(peer) {
            for message in unit {
                enqueue_at(entry, message, priority);
            }
        }
        sent_own
    }

    /// Queue what `peer` is believed to lack of `id` at its own priority.
    /// Returns whether anything was queued.
    fn send_diff(
        &mut self,
        host: &dyn SyncHost,
        peer_id: &PeerId,
        id: &RawCoId,
        reply: Reply,
    ) -> bool {
        let messages = self.diff(host, peer_id, id, reply);
        let queued = !messages.is_empty();
        for message in messages {
            self.send(peer_id, message);
        }
        queued
    }

    /// Messages carrying what `peer` is believed to lack of `id`. The
    /// pieces are recorded as sent.
    fn diff(
        &mut self,
        host: &dyn SyncHost,
        peer_id: &PeerId,
        id: &RawCoId,
        reply: Reply,
    ) -> Vec<SyncMessage> {
        let Some(ours) = host.known_state(id) else {
            return Vec::new();
        };
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Vec::new();
        };
        if peer.closed {
            return Vec::new();
        }
        let since = peer.optimistic(id).cloned();
        let Some(pieces) = host.new_content_since(id, since.as_ref()) else {
            return Vec::new();
        };

        pieces
            .into_iter()
            .map(|piece| {
                peer.known_mut(id).record_sent(&piece.known_state_after());
                match reply {
                    Reply::Data => SyncMessage::Data {
                        known_state: ours.clone(),
                        known: true,
                        content: Some(piece),
                    },
                    Reply::Push => SyncMessage::Push {
                        known_state: ours.clone(),
                        content: piece,
                    },
                }
            })
            .collect()
    }

    fn send(&self, peer_id: &PeerId, message: SyncMessage) {
        if let Some(peer) = self.peers.get(peer_id) {
            enqueue(peer, message);
        }
    }

    fn mark_pulling(&mut self, peer_id: &PeerId, id: &RawCoId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.known_mut(id).phase = SyncPhase::Pulling;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Start or continue loading `id` from peers. Storage peers are asked
    /// first, then servers, then mesh peers, each group by descending peer
    /// priority, one peer at a time.
    pub fn load(&mut self, host: &dyn SyncHost, id: RawCoId) -> LoadStatus {
        if host.known_state(&id).is_some() {
            self.loads.remove(&id);
            return LoadStatus::Available;
        }
        if let Some(load) = self.loads.get(&id) {
            if load.status == LoadStatus::Loading {
                return LoadStatus::Loading;
            }
        }

        let mut candidates: Vec<(u8, &PeerEntry)> = self
            .peers
            .values()
            .filter(|p| !p.closed)
            .filter_map(|p| Some((p.role().load_rank()?, p)))
            .collect();
        candidates.sort_by_key(|(rank, p)| (*rank, std::cmp::Reverse(p.config.priority)));
        let candidates = candidates.into_iter().map(|(_, p)| p.id().clone()).collect();

        self.loads.insert(
            id,
            LoadState {
                candidates,
                asked: None,
                status: LoadStatus::Loading,
            },
        );
        self.ask_next(host, &id)
    }

    /// Status of a load started with [`SyncManager::load`].
    pub fn load_status(&self, id: &RawCoId) -> Option<LoadStatus> {
        self.loads.get(id).map(|l| l.status)
    }

    fn ask_next(&mut self, host: &dyn SyncHost, id: &RawCoId) -> LoadStatus {
        loop {
            let Some(load) = self.loads.get_mut(id) else {
                return LoadStatus::Unavailable;
            };
            let Some(peer) = load.candidates.pop_front() else {
                debug!(id = %id, "no peer has the CoValue");
                load.asked = None;
                load.status = LoadStatus::Unavailable;
                return LoadStatus::Unavailable;
            };
            if !self.peers.contains_key(&peer) {
                continue;
            }
            load.asked = Some(peer.clone());
            let known_state = host
                .known_state(id)
                .unwrap_or_else(|| CoValueKnownState::empty(*id));
            debug!(id = %id, peer = %peer, "loading from peer");
            self.mark_pulling(&peer, id);
            self.send(&peer, SyncMessage::Pull { known_state });
            return LoadStatus::Loading;
        }
    }

    fn load_missed(&mut self, host: &dyn SyncHost, from: &PeerId, id: &RawCoId) {
        let asked_them = self
            .loads
            .get(id)
            .is_some_and(|l| l.status == LoadStatus::Loading && l.asked.as_ref() == Some(from));
        if asked_them && host.known_state(id).is_none() {
            self.ask_next(host, id);
        }
    }

    fn refresh_loads(&mut self, host: &dyn SyncHost) {
        for (id, load) in self.loads.iter_mut() {
            if load.status != LoadStatus::Available && host.known_state(id).is_some() {
                debug!(id = %id, "CoValue loaded");
                load.status = LoadStatus::Available;
                load.asked = None;
            }
        }
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("loads", &self.loads.len())
            .finish()
    }
}

fn enqueue(peer: &PeerEntry, message: SyncMessage) {
    let priority = message.priority();
    enqueue_at(peer, message, priority);
}

fn enqueue_at(peer: &PeerEntry, message: SyncMessage, priority: Priority) {
    for wire in peer.config.dialect.outgoing(message) {
        match encode_message(&wire) {
            Ok(line) => {
                trace!(peer = %peer.id(), action = wire.action(), id = %wire.id(), "queueing");
                drop(peer.queue.push(priority, line));
            }
            Err(e) => warn!(peer = %peer.id(), error = %e, "cannot encode message"),
        }
    }
}
