//! # dissem core
//!
//! Pure primitives for the dissem replication control plane: identifiers,
//! sequence ranges, control messages and configuration.
//!
//! This crate contains no I/O, no timers and no networking.
//!
//! ## Key Types
//!
//! - [`NodeId`] - A peer in the mesh
//! - [`MessageId`] - An application message (`group:publisher:seq` or opaque)
//! - [`KnownMessages`] - Per-group catalogue of held messages, used as a
//!   replication exclusion list
//! - [`ControlMessage`] - Retransmission hints, acks and the session handshake
//! - [`ReplicationConfig`] - Engine, session and strategy settings

pub mod config;
pub mod error;
pub mod filter;
pub mod messages;
pub mod ranges;
pub mod types;

pub use config::{EngineConfig, ReplicationConfig, SessionConfig, StrategyConfig, StrategyKind};
pub use error::{ConfigError, CoreError, Result};
pub use filter::{parse_pattern_list, wildcard_match, TargetFilter};
pub use messages::{limits, ControlMessage, PROTOCOL_VERSION};
pub use ranges::{KnownMessages, MessageRanges, SeqRange};
pub use types::{MessageId, MessageKey, NodeId};
