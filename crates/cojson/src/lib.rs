//! # cojson
//!
//! Local-first collaborative values that sync between peers and stay
//! verifiable end to end.
//!
//! ## Overview
//!
//! A node holds CoValues: maps, lists, streams and plain text whose state
//! is the deterministic projection of signed, append-only sessions of
//! transactions. Groups decide who may read and write; readers get keys
//! sealed to them, so relays and storage never see plaintext.
//!
//! - **[`LocalNode`]**: the CoValues of one account, and the single write
//!   path that local edits and received content both go through
//! - **[`Node`]**: a `LocalNode` plus the sync protocol, driven by one
//!   reader and one writer task per peer
//! - **Storage**: a [`Store`](cojson_store::Store) served as a peer, so
//!   loading from disk and from a server share one code path
//!
//! ## Key Properties
//!
//! - **Convergence**: replicas with the same transactions materialize the
//!   same content, whatever order they arrived in
//! - **Permission causality**: a write counts only if its author held a
//!   writing role at the write's `madeAt`
//! - **Verifiability**: every session is hash-chained and signed by the
//!   author's agent
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cojson::{CreateOptions, LocalNode, Node, NodeConfig};
//! use cojson::core::system_clock;
//! use cojson::perms::{MemberKey, Role};
//! use cojson::sync::{PeerConfig, PeerRole};
//! use serde_json::json;
//!
//! async fn example() -> cojson::Result<()> {
//!     let node = Node::new(LocalNode::create_account(system_clock())?, NodeConfig::default());
//!
//!     let (ours, _theirs) = cojson::sync::pair();
//!     node.add_peer(PeerConfig::new("server", PeerRole::Server), ours).await?;
//!
//!     let map = node
//!         .with_local(|local| {
//!             let group = local.create_group()?;
//!             local.add_member(&group, MemberKey::Everyone, Role::Reader)?;
//!             local.create_map(CreateOptions::owned_by(group), [("title".to_string(), json!("hi"))])
//!         })
//!         .await?;
//!     println!("{}", node.view(&map).await?.to_json());
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `cojson::core` - Identifiers, crypto, sessions and content types
//! - `cojson::perms` - Groups, roles, keys and invites
//! - `cojson::sync` - Sync protocol, outgoing queues and transports
//! - `cojson::store` - Storage backends and the storage peer

pub mod authorizer;
pub mod config;
pub mod error;
pub mod local_node;
pub mod logging;
pub mod node;

// Re-export component crates
pub use cojson_core as core;
pub use cojson_perms as perms;
pub use cojson_store as store;
pub use cojson_sync as sync;

// Re-export main types for convenience
pub use authorizer::NodeAuthorizer;
pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use local_node::{CoValueView, CreateOptions, LocalNode, SubscriptionId};
pub use node::{CloseReason, LoadResult, Node};

// Re-export commonly used core types
pub use cojson_core::{
    ActorId, AgentSecret, CoValueContent, CoValueType, Privacy, RawCoId, SessionId,
};
