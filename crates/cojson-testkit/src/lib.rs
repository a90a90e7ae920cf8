//! # cojson testkit
//!
//! Testing utilities for cojson.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: accounts on a shared manual clock, running nodes and
//!   in-memory connections between them
//! - **Replication**: synchronous copying between local nodes through the
//!   receiving node's write path, for tests without a runtime
//! - **Generators**: Proptest strategies for edits to maps and lists
//!
//! ## Test Fixtures
//!
//! ```rust
//! use cojson::CreateOptions;
//! use cojson_testkit::fixtures::{replicate, TestFixture};
//! use serde_json::json;
//!
//! let fixture = TestFixture::new();
//! let mut alice = fixture.local_node();
//! let mut bob = fixture.local_node();
//!
//! let map = alice
//!     .create_map(CreateOptions::default(), [("k".to_string(), json!(1))])
//!     .unwrap();
//! replicate(&alice, &mut bob);
//! assert_eq!(bob.content(&map).unwrap().to_json(), json!({"k": 1}));
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use cojson_testkit::generators::map_edits;
//!
//! proptest! {
//!     #[test]
//!     fn edits_apply(edits in map_edits(10)) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{connect, connect_peers, exchange, multi_party_fixtures, replicate, TestFixture};
