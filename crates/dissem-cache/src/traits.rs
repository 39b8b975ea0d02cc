//! DataCache trait: the interface the replication control plane needs from
//! the local data cache.
//!
//! Storage, eviction and querying live behind this trait. The control plane
//! only enumerates what is held, asks what has not reached a target yet, and
//! records deliveries in the transmission history.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dissem_core::{KnownMessages, MessageId, NodeId};

use crate::error::Result;

/// A message as announced by a cache update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMessage {
    /// Message identifier.
    pub id: MessageId,
    /// Group it was published under.
    pub group: String,
    /// Payload bytes held so far.
    pub payload: Bytes,
    /// Whether every fragment of the message is present.
    pub complete: bool,
}

impl CachedMessage {
    /// A complete message.
    pub fn complete(id: MessageId, group: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            group: group.into(),
            payload: payload.into(),
            complete: true,
        }
    }

    /// A message of which only some fragments are held.
    pub fn partial(id: MessageId, group: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            complete: false,
            ..Self::complete(id, group, payload)
        }
    }
}

/// Async interface to the local data cache.
///
/// # Design Notes
///
/// - **Scope**: `groups` arguments restrict a query; an empty slice means
///   every group.
/// - **Idempotent history**: recording the same delivery twice is not an
///   error.
#[async_trait]
pub trait DataCache: Send + Sync {
    /// Enumerate complete messages held for the given groups.
    async fn known_messages(&self, groups: &[String]) -> Result<KnownMessages>;

    /// Complete messages not yet delivered to `target`, minus `exclude`,
    /// in cache insertion order.
    async fn not_replicated(
        &self,
        target: &NodeId,
        groups: &[String],
        exclude: Option<&KnownMessages>,
    ) -> Result<Vec<MessageId>>;

    /// Record that `message` has reached `target`.
    async fn record_replicated(&self, message: &MessageId, target: &NodeId) -> Result<()>;

    /// Whether `message` has been recorded as delivered to `target`.
    async fn was_replicated(&self, message: &MessageId, target: &NodeId) -> Result<bool>;

    /// Whether the cache holds the complete message.
    async fn has_complete(&self, message: &MessageId) -> Result<bool>;
}

#[async_trait]
impl<C: DataCache + ?Sized> DataCache for Arc<C> {
    async fn known_messages(&self, groups: &[String]) -> Result<KnownMessages> {
        (**self).known_messages(groups).await
    }

    async fn not_replicated(
        &self,
        target: &NodeId,
        groups: &[String],
        exclude: Option<&KnownMessages>,
    ) -> Result<Vec<MessageId>> {
        (**self).not_replicated(target, groups, exclude).await
    }

    async fn record_replicated(&self, message: &MessageId, target: &NodeId) -> Result<()> {
        (**self).record_replicated(message, target).await
    }

    async fn was_replicated(&self, message: &MessageId, target: &NodeId) -> Result<bool> {
        (**self).was_replicated(message, target).await
    }

    async fn has_complete(&self, message: &MessageId) -> Result<bool> {
        (**self).has_complete(message).await
    }
}
