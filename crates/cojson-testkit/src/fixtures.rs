//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;
use std::time::Duration;

use cojson::{CloseReason, LocalNode, Node, NodeConfig};
use cojson_core::{Clock, ManualClock, RawCoId};
use cojson_sync::{PeerConfig, PeerRole, SyncHost};
use tokio::task::JoinHandle;

/// Accounts that share one manual clock.
pub struct TestFixture {
    pub clock: Arc<ManualClock>,
}

impl TestFixture {
    /// Create a fixture whose clock starts at `1_000`.
    pub fn new() -> Self {
        Self::starting_at(1_000)
    }

    pub fn starting_at(millis: i64) -> Self {
        Self {
            clock: ManualClock::new(millis),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Move the shared clock forward.
    pub fn advance(&self, millis: i64) {
        self.clock.advance(millis);
    }

    /// A new account on its own local node.
    pub fn local_node(&self) -> LocalNode {
        LocalNode::create_account(self.clock()).expect("account creation")
    }

    /// A new account on a running node with default config.
    pub fn node(&self) -> Node {
        self.node_with_config(NodeConfig::default())
    }

    pub fn node_with_config(&self, config: NodeConfig) -> Node {
        Node::new(self.local_node(), config)
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Create `n` local nodes sharing one clock.
pub fn multi_party_fixtures(n: usize) -> (TestFixture, Vec<LocalNode>) {
    let fixture = TestFixture::new();
    let nodes = (0..n).map(|_| fixture.local_node()).collect();
    (fixture, nodes)
}

// ─────────────────────────────────────────────────────────────────────────────
// Connecting nodes
// ─────────────────────────────────────────────────────────────────────────────

/// Connect `client` to `server` over an in-memory transport.
pub async fn connect(client: &Node, server: &Node) -> (JoinHandle<CloseReason>, JoinHandle<CloseReason>) {
    connect_as(client, server, PeerRole::Server, PeerRole::Client).await
}

/// Connect two mesh peers that each push everything to the other.
pub async fn connect_peers(a: &Node, b: &Node) -> (JoinHandle<CloseReason>, JoinHandle<CloseReason>) {
    connect_as(a, b, PeerRole::Peer, PeerRole::Peer).await
}

async fn connect_as(
    a: &Node,
    b: &Node,
    a_sees_b: PeerRole,
    b_sees_a: PeerRole,
) -> (JoinHandle<CloseReason>, JoinHandle<CloseReason>) {
    let (a_end, b_end) = cojson_sync::pair();
    let a_id = a.account_id().await;
    let b_id = b.account_id().await;
    let a_task = a
        .add_peer(PeerConfig::new(b_id.to_string(), a_sees_b), a_end)
        .await
        .expect("add peer");
    let b_task = b
        .add_peer(PeerConfig::new(a_id.to_string(), b_sees_a), b_end)
        .await
        .expect("add peer");
    (a_task, b_task)
}

/// Wait for all `nodes` to go quiet.
pub async fn settle(nodes: &[&Node]) {
    for _ in 0..3 {
        for node in nodes {
            node.settle(Duration::from_millis(50)).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Synchronous replication
// ─────────────────────────────────────────────────────────────────────────────

/// Copy everything `from` has into `to` through `to`'s write path,
/// dependencies first. Returns the number of transactions applied.
pub fn replicate(from: &LocalNode, to: &mut LocalNode) -> usize {
    let mut applied = 0;
    for id in from.co_value_ids() {
        applied += replicate_one(from, to, &id);
    }
    applied
}

/// Copy `id` and its dependencies from `from` into `to`.
pub fn replicate_one(from: &LocalNode, to: &mut LocalNode, id: &RawCoId) -> usize {
    let mut applied = 0;
    let mut ids = from.dependencies(id);
    ids.push(*id);
    for id in ids {
        let known = to.known_state(&id);
        let Some(pieces) = from.new_content_since(&id, known.as_ref()) else {
            continue;
        };
        for piece in pieces {
            applied += to.apply_content(&piece).applied;
        }
    }
    applied
}

/// Replicate both ways.
pub fn exchange(a: &mut LocalNode, b: &mut LocalNode) {
    replicate(a, b);
    replicate(b, a);
}
