//! # dissem
//!
//! Reliable replication control plane for disconnected, intermittent and
//! limited-bandwidth (DDIL) meshes.
//!
//! ## Overview
//!
//! A node's dissemination service moves bytes; this crate decides what has
//! to reach whom and makes sure it gets there:
//!
//! - **Reliable delivery**: per-peer windows of unacknowledged messages,
//!   retried on timeout, with cheap completion requests for receivers that
//!   already hold part of a message
//! - **Neighbour tracking**: work for a peer that drops off the mesh is
//!   parked and resumed when it comes back
//! - **Strategies**: push (to everyone, a convoy, or well-connected peers),
//!   pull, or target-based replication sessions
//! - **Sessions**: a handshake that tells the initiator what the target
//!   already has, followed by batched acknowledgments
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dissem::{ReplicationConfig, ReplicationService};
//! use dissem::cache::{CachedMessage, MemoryCache};
//! use dissem::core::{MessageId, NodeId, StrategyKind};
//! use dissem::replication::MemoryMesh;
//!
//! async fn example() {
//!     let mesh = MemoryMesh::new();
//!     let gateway = Arc::new(mesh.create_gateway(NodeId::new("uav-1")).await);
//!     let cache = Arc::new(MemoryCache::new());
//!
//!     let mut config = ReplicationConfig::default();
//!     config.strategy.kind = StrategyKind::Push;
//!     let service = ReplicationService::new(gateway, Arc::clone(&cache), config).unwrap();
//!
//!     service.new_neighbor(&NodeId::new("gw-1"));
//!
//!     let message = CachedMessage::complete(
//!         MessageId::new("tracks", &NodeId::new("uav-1"), 1),
//!         "tracks",
//!         &b"payload"[..],
//!     );
//!     cache.insert(message.clone()).unwrap();
//!     service.on_cache_updated(&message).await;
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `dissem::core` - Identifiers, ranges, control messages, configuration
//! - `dissem::cache` - The data cache interface and an in-memory cache
//! - `dissem::replication` - Engine, sessions, strategies and gateways

pub mod error;
pub mod service;

// Re-export component crates
pub use dissem_cache as cache;
pub use dissem_core as core;
pub use dissem_replication as replication;

// Re-export main types for convenience
pub use error::{Result, ServiceError};
pub use service::ReplicationService;

// Re-export commonly used types
pub use dissem_cache::{CachedMessage, DataCache};
pub use dissem_core::{ControlMessage, MessageId, NodeId, ReplicationConfig, StrategyKind};
pub use dissem_replication::{Gateway, SessionOutcome, SessionState};
