//! Receiver side of a replication session: ack batching.

use std::time::Duration;

use dissem_core::{MessageId, NodeId};
use tokio::time::Instant;

/// A session in which a remote initiator replicates to this node.
#[derive(Debug)]
pub struct ReceiverSession {
    id: u64,
    local: NodeId,
    source: NodeId,
    send_current_data_list: bool,
    generate_acks: bool,
    groups: Vec<String>,
    pending_acks: Vec<MessageId>,
    last_ack_flush: Instant,
    batch_size: usize,
    flush_interval: Duration,
}

impl ReceiverSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        local: NodeId,
        source: NodeId,
        send_current_data_list: bool,
        generate_acks: bool,
        groups: Vec<String>,
        batch_size: usize,
        flush_interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            id,
            local,
            source,
            send_current_data_list,
            generate_acks,
            groups,
            pending_acks: Vec::new(),
            last_ack_flush: now,
            batch_size: batch_size.max(1),
            flush_interval,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn source(&self) -> &NodeId {
        &self.source
    }

    pub fn send_current_data_list(&self) -> bool {
        self.send_current_data_list
    }

    pub fn generate_acks(&self) -> bool {
        self.generate_acks
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn pending_acks(&self) -> &[MessageId] {
        &self.pending_acks
    }

    /// Note a completed message. Returns a batch when one is due.
    pub fn record(&mut self, message: MessageId, now: Instant) -> Option<Vec<MessageId>> {
        if !self.generate_acks || self.pending_acks.contains(&message) {
            return None;
        }
        self.pending_acks.push(message);
        if self.pending_acks.len() >= self.batch_size
            || now.duration_since(self.last_ack_flush) >= self.flush_interval
        {
            Some(self.take(now))
        } else {
            None
        }
    }

    /// The pending batch, if the flush interval has elapsed.
    pub fn flush_due(&mut self, now: Instant) -> Option<Vec<MessageId>> {
        if self.pending_acks.is_empty()
            || now.duration_since(self.last_ack_flush) < self.flush_interval
        {
            return None;
        }
        Some(self.take(now))
    }

    /// Whatever is pending, regardless of timing.
    pub fn drain(&mut self, now: Instant) -> Option<Vec<MessageId>> {
        if self.pending_acks.is_empty() {
            return None;
        }
        Some(self.take(now))
    }

    fn take(&mut self, now: Instant) -> Vec<MessageId> {
        self.last_ack_flush = now;
        std::mem::take(&mut self.pending_acks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(5);

    fn session(generate_acks: bool, start: Instant) -> ReceiverSession {
        ReceiverSession::new(
            1,
            NodeId::new("local"),
            NodeId::new("source"),
            true,
            generate_acks,
            Vec::new(),
            10,
            INTERVAL,
            start,
        )
    }

    fn id(n: u32) -> MessageId {
        MessageId::opaque(format!("m{}", n))
    }

    #[test]
    fn test_batch_flushes_at_size() {
        let start = Instant::now();
        let mut s = session(true, start);
        for n in 1..10 {
            assert!(s.record(id(n), start).is_none());
        }
        let batch = s.record(id(10), start).unwrap();
        assert_eq!(batch.len(), 10);
        assert!(s.pending_acks().is_empty());
    }

    #[test]
    fn test_interval_flush() {
        let start = Instant::now();
        let mut s = session(true, start);
        s.record(id(1), start);
        assert!(s.flush_due(start + Duration::from_secs(1)).is_none());
        assert_eq!(s.flush_due(start + INTERVAL), Some(vec![id(1)]));
        assert!(s.flush_due(start + INTERVAL * 3).is_none());
    }

    #[test]
    fn test_no_acks_when_not_asked() {
        let start = Instant::now();
        let mut s = session(false, start);
        assert!(s.record(id(1), start + INTERVAL).is_none());
        assert!(s.drain(start).is_none());
    }

    #[test]
    fn test_duplicates_not_acked_twice() {
        let start = Instant::now();
        let mut s = session(true, start);
        s.record(id(1), start);
        s.record(id(1), start);
        assert_eq!(s.drain(start), Some(vec![id(1)]));
    }
}
