//! Error types for the replication layer.

use dissem_core::NodeId;
use thiserror::Error;

/// Errors that can occur while replicating.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Transport-level error reported by the gateway.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The gateway has no route to the peer.
    #[error("peer not connected: {0}")]
    PeerNotConnected(NodeId),

    /// Control message could not be encoded or decoded.
    #[error("codec error: {0}")]
    CodecError(#[from] dissem_core::CoreError),
}

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;
