//! # dissem testkit
//!
//! Testing utilities for dissem.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Clusters**: several replication services on one in-memory mesh, with
//!   a pump that delivers what they send to each other
//! - **Generators**: Proptest strategies for property-based testing
//! - **Fixtures**: Fast configurations, messages and log setup
//!
//! ## Simulated Clusters
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use dissem::core::StrategyKind;
//! use dissem_testkit::{fast_config, TestCluster};
//!
//! async fn example() {
//!     let cluster = TestCluster::new(&["a", "b"], fast_config(StrategyKind::Push)).await;
//!     cluster.connect_all();
//!     let message = cluster.publish("a", "tracks", 1).await;
//!     cluster.run_for(Duration::from_secs(1)).await;
//!     assert!(cluster.holds("b", &message.id));
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use dissem_testkit::generators::message_keys;
//!
//! proptest! {
//!     #[test]
//!     fn known_messages_hold_what_was_inserted(keys in message_keys(50)) {
//!         let known = dissem_testkit::generators::known_from(&keys);
//!         for key in &keys {
//!             prop_assert!(known.contains(key));
//!         }
//!     }
//! }
//! ```

pub mod cluster;
pub mod fixtures;
pub mod generators;

pub use cluster::{TestCluster, TestNode};
pub use fixtures::{fast_config, init_tracing, message, node_id, random_payload};
