//! # dissem replication
//!
//! The moving parts of the replication control plane:
//!
//! - [`RetransmissionEngine`] - windowed, ack-driven reliable delivery with
//!   timeout-based retries
//! - [`PeerLiveness`] - neighbour up/down events, consumed lazily
//! - [`SessionManager`] - target-based replication sessions with batch acks
//! - [`ReplicationStrategy`] - the per-node policy deciding what goes where
//! - [`Gateway`] - the outbound interface everything above drives
//!
//! ## Key Properties
//!
//! - **Bounded**: at most `transmission_window` unacknowledged messages per
//!   peer
//! - **Persistent**: a failed send stays unacknowledged and is retried after
//!   its timeout
//! - **Cheap on thin links**: a receiver that already knows a message is
//!   nudged to pull it rather than sent it again in full
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dissem_core::{EngineConfig, MessageId, NodeId};
//! use dissem_replication::{MemoryMesh, PeerLiveness, RetransmissionEngine};
//!
//! async fn example() {
//!     let mesh = MemoryMesh::new();
//!     let gateway = Arc::new(mesh.create_gateway(NodeId::new("uav-1")).await);
//!     let engine = RetransmissionEngine::new(
//!         gateway,
//!         Arc::new(PeerLiveness::new()),
//!         EngineConfig::default(),
//!     );
//!
//!     let peer = NodeId::new("gw-1");
//!     let id = MessageId::new("tracks", &NodeId::new("uav-1"), 1);
//!     engine.request_ack(&peer, Some(id.clone()));
//!
//!     // ... later, when the peer's Ack arrives:
//!     engine.on_acknowledged(&id, &peer);
//! }
//! ```

pub mod engine;
pub mod error;
pub mod gateway;
pub mod liveness;
pub mod session;
pub mod strategy;

pub use engine::{MessageState, RetransmissionEngine, TargetQueue, Transmission};
pub use error::{ReplicationError, Result};
pub use gateway::{
    memory::{Inbound, MemoryGateway, MemoryMesh, SentKind, SentRecord},
    Gateway,
};
pub use liveness::{LivenessChange, PeerLiveness};
pub use session::{
    ReceiverSession, ReplicationSession, SessionManager, SessionOutcome, SessionState,
};
pub use strategy::{PullReplicator, PushReplicator, PushScope, ReplicationStrategy};
