//! In-memory implementation of the DataCache trait.
//!
//! This is primarily for testing and for nodes that keep no persistent
//! cache. Everything is lost when the cache is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use dissem_core::{KnownMessages, MessageId, NodeId};

use crate::error::{CacheError, Result};
use crate::traits::{CachedMessage, DataCache};

/// In-memory cache implementation.
///
/// Thread-safe via RwLock.
pub struct MemoryCache {
    inner: RwLock<MemoryCacheInner>,
}

#[derive(Default)]
struct MemoryCacheInner {
    /// Messages indexed by ID.
    messages: HashMap<MessageId, CachedMessage>,

    /// Insertion order, for stable replication order.
    order: Vec<MessageId>,

    /// Transmission history: target -> delivered messages.
    history: HashMap<NodeId, HashSet<MessageId>>,
}

impl MemoryCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryCacheInner::default()),
        }
    }

    /// Add or update a message.
    ///
    /// Returns `true` if the message was not held before. A complete copy
    /// never gets replaced by a partial one.
    pub fn insert(&self, message: CachedMessage) -> Result<bool> {
        let mut inner = self.write()?;
        let held_complete = inner.messages.get(&message.id).map(|held| held.complete);
        match held_complete {
            Some(true) if !message.complete => Ok(false),
            Some(_) => {
                inner.messages.insert(message.id.clone(), message);
                Ok(false)
            }
            None => {
                inner.order.push(message.id.clone());
                inner.messages.insert(message.id.clone(), message);
                Ok(true)
            }
        }
    }

    /// Look up a message.
    pub fn get(&self, id: &MessageId) -> Result<Option<CachedMessage>> {
        Ok(self.read()?.messages.get(id).cloned())
    }

    /// Number of messages held.
    pub fn len(&self) -> usize {
        self.read().map(|inner| inner.messages.len()).unwrap_or(0)
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryCacheInner>> {
        self.inner
            .read()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryCacheInner>> {
        self.inner
            .write()
            .map_err(|_| CacheError::Unavailable("cache lock poisoned".into()))
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn in_scope(message: &CachedMessage, groups: &[String]) -> bool {
    groups.is_empty() || groups.contains(&message.group)
}

#[async_trait]
impl DataCache for MemoryCache {
    async fn known_messages(&self, groups: &[String]) -> Result<KnownMessages> {
        let inner = self.read()?;
        let mut known = KnownMessages::new();
        for message in inner.messages.values() {
            if message.complete && in_scope(message, groups) {
                known.insert_id(&message.id);
            }
        }
        Ok(known)
    }

    async fn not_replicated(
        &self,
        target: &NodeId,
        groups: &[String],
        exclude: Option<&KnownMessages>,
    ) -> Result<Vec<MessageId>> {
        let inner = self.read()?;
        let delivered = inner.history.get(target);

        let ids = inner
            .order
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|message| message.complete && in_scope(message, groups))
            .filter(|message| delivered.map_or(true, |d| !d.contains(&message.id)))
            .filter(|message| exclude.map_or(true, |e| !e.contains_id(&message.id)))
            // Never replicate a message back to its publisher.
            .filter(|message| {
                message
                    .id
                    .key()
                    .map_or(true, |key| &key.publisher != target)
            })
            .map(|message| message.id.clone())
            .collect();

        Ok(ids)
    }

    async fn record_replicated(&self, message: &MessageId, target: &NodeId) -> Result<()> {
        let mut inner = self.write()?;
        if inner
            .history
            .entry(target.clone())
            .or_default()
            .insert(message.clone())
        {
            tracing::trace!(message = %message, target = %target, "recorded delivery");
        }
        Ok(())
    }

    async fn was_replicated(&self, message: &MessageId, target: &NodeId) -> Result<bool> {
        let inner = self.read()?;
        Ok(inner
            .history
            .get(target)
            .map_or(false, |delivered| delivered.contains(message)))
    }

    async fn has_complete(&self, message: &MessageId) -> Result<bool> {
        let inner = self.read()?;
        Ok(inner
            .messages
            .get(message)
            .map_or(false, |cached| cached.complete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(group: &str, publisher: &str, seq: u64) -> CachedMessage {
        CachedMessage::complete(
            MessageId::new(group, &NodeId::new(publisher), seq),
            group,
            vec![seq as u8],
        )
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let cache = MemoryCache::new();
        assert!(cache.insert(msg("tracks", "a", 1)).unwrap());
        assert!(!cache.insert(msg("tracks", "a", 1)).unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_does_not_replace_complete() {
        let cache = MemoryCache::new();
        let complete = msg("tracks", "a", 1);
        let partial = CachedMessage::partial(complete.id.clone(), "tracks", Bytes::new());
        cache.insert(complete.clone()).unwrap();
        cache.insert(partial).unwrap();
        assert!(cache.has_complete(&complete.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_known_messages_by_group() {
        let cache = MemoryCache::new();
        cache.insert(msg("tracks", "a", 1)).unwrap();
        cache.insert(msg("tracks", "a", 2)).unwrap();
        cache.insert(msg("chat", "b", 9)).unwrap();
        cache
            .insert(CachedMessage::partial(
                MessageId::new("chat", &NodeId::new("b"), 10),
                "chat",
                Bytes::new(),
            ))
            .unwrap();

        let all = cache.known_messages(&[]).await.unwrap();
        assert_eq!(all.count(), 3);

        let chat = cache.known_messages(&["chat".to_string()]).await.unwrap();
        assert_eq!(chat.count(), 1);
        assert!(chat.contains_id(&MessageId::new("chat", &NodeId::new("b"), 9)));
    }

    #[tokio::test]
    async fn test_not_replicated_honours_history_and_exclusions() {
        let cache = MemoryCache::new();
        let target = NodeId::new("t");
        for seq in 1..=4 {
            cache.insert(msg("tracks", "a", seq)).unwrap();
        }
        cache.insert(msg("tracks", "t", 1)).unwrap();

        let first = MessageId::new("tracks", &NodeId::new("a"), 1);
        cache.record_replicated(&first, &target).await.unwrap();

        let mut exclude = KnownMessages::new();
        exclude.insert_id(&MessageId::new("tracks", &NodeId::new("a"), 3));

        let ids = cache
            .not_replicated(&target, &[], Some(&exclude))
            .await
            .unwrap();
        let seqs: Vec<u64> = ids.iter().map(|id| id.key().unwrap().seq).collect();
        assert_eq!(seqs, vec![2, 4]);
        assert!(cache.was_replicated(&first, &target).await.unwrap());
    }
}
