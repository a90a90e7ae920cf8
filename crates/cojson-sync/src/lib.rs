//! # cojson sync
//!
//! Sync protocol between cojson nodes.
//!
//! ## Overview
//!
//! Each peer connection runs the same small protocol per CoValue: a node
//! sends what it has (`pull`), the other side answers with what is missing
//! (`data`), and later changes are sent unasked (`push`) and acknowledged
//! (`ack`). Known states are compared instead of transactions, so every
//! exchange sends only what the other side lacks.
//!
//! ## Key Properties
//!
//! - **Idempotent**: re-delivered transactions are no-ops
//! - **Self-correcting**: a peer that reports less than believed is re-diffed
//! - **Validated relay**: content is applied locally before it is forwarded
//! - **Prioritized**: group and account content overtakes bulk content
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cojson_core::system_clock;
//! use cojson_sync::{PeerConfig, PeerRole, SyncConfig, SyncManager};
//!
//! let mut sync = SyncManager::new(SyncConfig::default(), system_clock());
//! // let queue = sync.add_peer(&host, PeerConfig::new("server", PeerRole::Server));
//! // sync.handle_frame(&mut host, &peer_id, &frame)?;
//! // while let Some(batch) = queue.next_batch().await { transport.send(batch.frame).await?; }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Client                              Server
//!   |-------- pull (known state) ----->|
//!   |<------- data (dependencies) -----|
//!   |<------- data (content) ----------|
//!   |-------- push (new edit) -------->|
//!   |<------- ack ---------------------|
//! ```

pub mod codec;
pub mod dialect;
pub mod error;
pub mod messages;
pub mod peer;
pub mod protocol;
pub mod queue;
pub mod transport;

pub use codec::{decode_frame, encode_message, join_lines, ping_line, Frame};
pub use dialect::Dialect;
pub use error::{Result, SyncError};
pub use messages::{limits, KnownMessage, PeerId, SyncMessage};
pub use peer::{PeerConfig, PeerEntry, PeerKnownState, PeerRole, SyncPhase};
pub use protocol::{
    ApplyReport, LoadStatus, ReconnectPolicy, SyncConfig, SyncHost, SyncManager,
};
pub use queue::{Batch, OutgoingQueue, Poll, PriorityQueue, QueueConfig, SendOutcome};
pub use transport::{
    memory::{listener, pair, MemoryConnector, MemoryListener, MemoryTransport},
    Connector, Transport,
};
