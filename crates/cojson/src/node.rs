//! The node runtime: a [`LocalNode`] and its [`SyncManager`] behind one
//! async lock, with a reader and a writer task per peer.
//!
//! Every mutation, local or received, happens while holding the lock, and
//! changes are relayed to peers before it is released. Writer tasks drain
//! the peer's outgoing queue into its transport; reader tasks feed frames
//! back in and keep the connection alive with pings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use cojson_core::{Priority, RawCoId};
use cojson_store::{StoragePeer, Store};
use cojson_sync::{
    ping_line, Connector, LoadStatus, OutgoingQueue, PeerConfig, PeerId, PeerRole, SendOutcome,
    SyncError, SyncManager, Transport,
};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::local_node::{CoValueView, LocalNode};

/// Why a peer connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this node.
    Closed,
    /// The other side hung up.
    Disconnected,
    /// Nothing arrived within the ping timeout.
    PingTimeout,
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Closed => write!(f, "closed"),
            CloseReason::Disconnected => write!(f, "disconnected"),
            CloseReason::PingTimeout => write!(f, "ping timeout"),
            CloseReason::Error(e) => write!(f, "error: {e}"),
        }
    }
}

impl CloseReason {
    /// The error an unexpected close amounts to. A deliberate close is not
    /// an error.
    pub fn error(&self, peer: &PeerId) -> Option<SyncError> {
        match self {
            CloseReason::Closed => None,
            CloseReason::Disconnected => Some(SyncError::PeerDisconnected(peer.to_string())),
            CloseReason::PingTimeout => Some(SyncError::PingTimeout(peer.to_string())),
            CloseReason::Error(e) => Some(SyncError::Transport(format!("{peer}: {e}"))),
        }
    }
}

/// Outcome of [`Node::load`].
#[derive(Debug, Clone)]
pub enum LoadResult {
    Available(CoValueView),
    /// Every peer asked answered that it does not have the CoValue.
    Unavailable,
    /// Peers did not answer within the load timeout.
    TimedOut,
}

impl LoadResult {
    pub fn is_available(&self) -> bool {
        matches!(self, LoadResult::Available(_))
    }

    pub fn view(self) -> Option<CoValueView> {
        match self {
            LoadResult::Available(view) => Some(view),
            _ => None,
        }
    }
}

struct PeerHandle {
    /// Distinguishes a replaced connection from the current one.
    generation: u64,
    shutdown: oneshot::Sender<()>,
}

struct NodeState {
    local: LocalNode,
    sync: SyncManager,
    peers: HashMap<PeerId, PeerHandle>,
    next_generation: u64,
    fatal: Option<String>,
}

impl NodeState {
    fn check_alive(&self) -> Result<()> {
        match &self.fatal {
            Some(reason) => Err(NodeError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }
}

/// A running node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Node {
    state: Arc<Mutex<NodeState>>,
    /// Bumped whenever peers may have changed what the node holds.
    progress: Arc<watch::Sender<u64>>,
    config: Arc<NodeConfig>,
}

impl Node {
    pub fn new(local: LocalNode, config: NodeConfig) -> Self {
        let sync = SyncManager::new(config.sync.clone(), local.clock().clone());
        let (progress, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(NodeState {
                local,
                sync,
                peers: HashMap::new(),
                next_generation: 0,
                fatal: None,
            })),
            progress: Arc::new(progress),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn bump(&self) {
        self.progress.send_modify(|n| *n = n.wrapping_add(1));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local access
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `f` against the local node, then relay whatever it changed.
    pub async fn with_local<R>(&self, f: impl FnOnce(&mut LocalNode) -> Result<R>) -> Result<R> {
        let mut guard = self.state.lock().await;
        guard.check_alive()?;
        let state = &mut *guard;
        let out = f(&mut state.local);
        state.sync.sync_changes(&mut state.local);
        drop(guard);
        self.bump();
        out
    }

    pub async fn account_id(&self) -> RawCoId {
        *self.state.lock().await.local.account_id()
    }

    /// View of a CoValue already held locally.
    pub async fn view(&self, id: &RawCoId) -> Result<CoValueView> {
        self.state.lock().await.local.view(id)
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.state.lock().await.sync.peer_ids().cloned().collect()
    }

    /// Why the node stopped, if a critical peer went away.
    pub async fn fatal_error(&self) -> Option<String> {
        self.state.lock().await.fatal.clone()
    }

    /// Load `id` from peers unless it is already held.
    ///
    /// Storage peers are asked before servers, one at a time.
    pub async fn load(&self, id: RawCoId) -> Result<LoadResult> {
        let timeout = Duration::from_millis(self.config.load_timeout_ms);
        match tokio::time::timeout(timeout, self.wait_for_load(id)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(id = %id, "load timed out");
                Ok(LoadResult::TimedOut)
            }
        }
    }

    async fn wait_for_load(&self, id: RawCoId) -> Result<LoadResult> {
        let mut progress = self.progress.subscribe();
        let mut started = false;
        loop {
            {
                let mut guard = self.state.lock().await;
                guard.check_alive()?;
                let state = &mut *guard;
                let status = if started {
                    state.sync.load_status(&id)
                } else {
                    started = true;
                    Some(state.sync.load(&state.local, id))
                };
                if state.local.has(&id) {
                    return Ok(LoadResult::Available(state.local.view(&id)?));
                }
                if status == Some(LoadStatus::Unavailable) {
                    return Ok(LoadResult::Unavailable);
                }
            }
            if progress.changed().await.is_err() {
                return Ok(LoadResult::Unavailable);
            }
        }
    }

    /// Wait until nothing changes for `quiet`. Useful after local edits
    /// when peers are expected to answer.
    pub async fn settle(&self, quiet: Duration) {
        let mut progress = self.progress.subscribe();
        while tokio::time::timeout(quiet, progress.changed()).await.is_ok_and(|r| r.is_ok()) {}
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Connect a peer over `transport`. The returned task resolves when
    /// the connection ends.
    pub async fn add_peer(
        &self,
        config: PeerConfig,
        transport: impl Transport + 'static,
    ) -> Result<JoinHandle<CloseReason>> {
        self.spawn_peer(config, Arc::new(transport)).await
    }

    /// Serve `store` to this node as a critical storage peer.
    pub async fn add_storage<S: Store + 'static>(
        &self,
        store: Arc<S>,
    ) -> Result<JoinHandle<CloseReason>> {
        let (node_end, storage_end) = cojson_sync::pair();
        let peer = StoragePeer::new(store);
        tokio::spawn(async move {
            if let Err(e) = peer.run(&storage_end).await {
                warn!(error = %e, "storage peer stopped");
            }
            storage_end.close().await;
        });
        let config = PeerConfig::new("storage", PeerRole::Storage).crash_on_close();
        self.add_peer(config, node_end).await
    }

    /// Keep a peer connected, reconnecting with backoff until it is closed
    /// with [`Node::close_peer`] or the node stops.
    pub fn connect_with_backoff(
        &self,
        config: PeerConfig,
        connector: Arc<dyn Connector>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let policy = node.config.sync.reconnect.clone();
            let mut attempt = 0u32;
            loop {
                match connector.connect().await {
                    Ok(transport) => {
                        attempt = 0;
                        let task = match node.spawn_peer(config.clone(), Arc::from(transport)).await {
                            Ok(task) => task,
                            Err(e) => {
                                warn!(peer = %config.id, error = %e, "not reconnecting");
                                return;
                            }
                        };
                        match task.await {
                            Ok(CloseReason::Closed) => return,
                            Ok(reason) => debug!(peer = %config.id, reason = %reason, "connection lost"),
                            Err(e) => warn!(peer = %config.id, error = %e, "peer task failed"),
                        }
                        if node.fatal_error().await.is_some() {
                            return;
                        }
                    }
                    Err(e) => warn!(peer = %config.id, attempt, error = %e, "connect failed"),
                }
                let delay = policy.delay(attempt);
                attempt = attempt.saturating_add(1);
                debug!(peer = %config.id, delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::time::sleep(delay).await;
            }
        })
    }

    /// Close a peer. Queued messages resolve as dropped; a message already
    /// handed to the transport is not interrupted.
    pub async fn close_peer(&self, id: &PeerId) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(handle) = state.peers.remove(id) else {
            return false;
        };
        state.sync.close_peer(&state.local, id);
        let _ = handle.shutdown.send(());
        drop(guard);
        self.bump();
        true
    }

    async fn spawn_peer(
        &self,
        config: PeerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<JoinHandle<CloseReason>> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (queue, generation) = {
            let mut guard = self.state.lock().await;
            guard.check_alive()?;
            let state = &mut *guard;
            let queue = state.sync.add_peer(&state.local, config.clone());
            state.next_generation += 1;
            let generation = state.next_generation;
            state.peers.insert(
                config.id.clone(),
                PeerHandle {
                    generation,
                    shutdown: shutdown_tx,
                },
            );
            (queue, generation)
        };
        info!(peer = %config.id, role = ?config.role, "peer connected");

        tokio::spawn(write_loop(config.id.clone(), queue.clone(), transport.clone()));
        let node = self.clone();
        Ok(tokio::spawn(async move {
            let reason = node
                .read_loop(&config, transport.as_ref(), &queue, shutdown_rx)
                .await;
            node.peer_closed(&config, generation, &reason, transport.as_ref())
                .await;
            reason
        }))
    }

    async fn read_loop(
        &self,
        config: &PeerConfig,
        transport: &dyn Transport,
        queue: &OutgoingQueue,
        mut shutdown: oneshot::Receiver<()>,
    ) -> CloseReason {
        let sync = &self.config.sync;
        let mut ping = tokio::time::interval(Duration::from_millis(sync.ping_interval_ms.max(1)));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let timeout = Duration::from_millis(sync.ping_timeout_ms);
        // Storage lives in-process and only speaks when spoken to.
        let check_liveness = config.role != PeerRole::Storage;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = &mut shutdown => return CloseReason::Closed,
                frame = transport.recv() => match frame {
                    Ok(Some(frame)) => {
                        last_seen = Instant::now();
                        if let Err(e) = self.handle_frame(&config.id, &frame).await {
                            return CloseReason::Error(e.to_string());
                        }
                    }
                    Ok(None) => return CloseReason::Disconnected,
                    Err(e) => return CloseReason::Error(e.to_string()),
                },
                _ = ping.tick() => {
                    if check_liveness && last_seen.elapsed() > timeout {
                        return CloseReason::PingTimeout;
                    }
                    let now = self.state.lock().await.local.clock().now_millis();
                    drop(queue.push(Priority::HIGH, ping_line(now)));
                    trace!(peer = %config.id, "ping");
                }
            }
        }
    }

    async fn handle_frame(&self, peer: &PeerId, frame: &[u8]) -> Result<()> {
        let mut guard = self.state.lock().await;
        guard.check_alive()?;
        let state = &mut *guard;
        state.sync.handle_frame(&mut state.local, peer, frame)?;
        drop(guard);
        self.bump();
        Ok(())
    }

    async fn peer_closed(
        &self,
        config: &PeerConfig,
        generation: u64,
        reason: &CloseReason,
        transport: &dyn Transport,
    ) {
        transport.close().await;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state
            .peers
            .get(&config.id)
            .is_some_and(|p| p.generation == generation)
        {
            state.peers.remove(&config.id);
            state.sync.close_peer(&state.local, &config.id);
        }

        match reason.error(&config.id) {
            Some(e) if config.crash_on_close => {
                error!(peer = %config.id, error = %e, "critical peer closed, stopping node");
                state.fatal.get_or_insert_with(|| e.to_string());
            }
            Some(e) => info!(peer = %config.id, error = %e, "peer closed"),
            None => info!(peer = %config.id, "peer closed"),
        }
        drop(guard);
        self.bump();
    }
}

async fn write_loop(peer: PeerId, queue: Arc<OutgoingQueue>, transport: Arc<dyn Transport>) {
    while let Some(batch) = queue.next_batch().await {
        match transport.send(batch.frame.clone()).await {
            Ok(()) => {
                trace!(peer = %peer, messages = batch.messages, "sent frame");
                batch.complete(SendOutcome::Sent);
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "send failed");
                batch.complete(SendOutcome::Dropped);
                break;
            }
        }
    }
    trace!(peer = %peer, "writer stopped");
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
