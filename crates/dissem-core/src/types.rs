//! Strong type definitions for dissem.
//!
//! Peers and messages are both identified by strings on the wire. They are
//! wrapped in newtypes so a peer id can never be passed where a message id
//! is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node in the mesh (a peer, target or destination).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from any printable string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random node id (16 random bytes, hex encoded).
    pub fn random() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (never a valid peer).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Globally unique identifier of one application message.
///
/// Treated as opaque by the retransmission machinery. Ids created with
/// [`MessageId::new`] follow the `group:publisher:seq` layout and can be
/// decomposed with [`MessageId::key`]; the group part may itself contain
/// `:` but the publisher may not.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Build an id from its group, publisher and sequence number.
    pub fn new(group: &str, publisher: &NodeId, seq: u64) -> Self {
        Self(format!("{}:{}:{}", group, publisher, seq))
    }

    /// Wrap an opaque id string.
    pub fn opaque(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decompose into group, publisher and sequence number.
    ///
    /// Returns `None` for ids that do not follow the `group:publisher:seq`
    /// layout.
    pub fn key(&self) -> Option<MessageKey> {
        let mut parts = self.0.rsplitn(3, ':');
        let seq = parts.next()?.parse::<u64>().ok()?;
        let publisher = parts.next()?;
        let group = parts.next()?;
        if group.is_empty() || publisher.is_empty() {
            return None;
        }
        Some(MessageKey {
            group: group.to_string(),
            publisher: NodeId::new(publisher),
            seq,
        })
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The structured parts of a [`MessageId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    /// Group the message was published under.
    pub group: String,
    /// Node that published the message.
    pub publisher: NodeId,
    /// Publisher-local sequence number.
    pub seq: u64,
}

impl MessageKey {
    /// Rebuild the message id.
    pub fn to_id(&self) -> MessageId {
        MessageId::new(&self.group, &self.publisher, self.seq)
    }
}
