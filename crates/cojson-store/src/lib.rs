//! # cojson store
//!
//! Persistence for CoValues, served to a node as a sync peer.
//!
//! ## Overview
//!
//! A [`Store`] keeps headers, session heads, transactions and signature
//! checkpoints. [`SqliteStore`] is the durable backend and [`MemoryStore`]
//! keeps the same semantics in memory. A [`StoragePeer`] puts a store
//! behind a [`Transport`](cojson_sync::Transport) so a node syncs with
//! its disk exactly as it syncs with a server.
//!
//! ## Key Types
//!
//! - [`Store`] - Blocking storage operations plus atomic units of work
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`StoragePeer`] - Answers sync messages from a store
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cojson_store::{SqliteStore, StoragePeer};
//!
//! async fn example() -> cojson_store::Result<()> {
//!     let store = Arc::new(SqliteStore::open("cojson.db")?);
//!     let (node_end, storage_end) = cojson_sync::pair();
//!     let peer = StoragePeer::new(store);
//!     tokio::spawn(async move { peer.run(&storage_end).await });
//!     // node.add_peer(PeerConfig::new("storage", PeerRole::Storage), node_end)
//!     # drop(node_end);
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic pieces**: a content piece is stored whole or not at all
//! - **No gaps**: content that would leave a gap is answered with a correction
//! - **Idempotent**: transactions already stored are skipped
//! - **Checkpoints**: large sessions are served in chunks that verify alone

pub mod error;
pub mod memory;
pub mod migration;
pub mod peer;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use peer::StoragePeer;
pub use sqlite::SqliteStore;
pub use traits::{
    append_session, dependencies, known_state, SessionUpdate, Store, StoreWriter, StoredCoValue,
    StoredSession,
};
