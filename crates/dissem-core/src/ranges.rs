//! Sequence ranges and the per-group catalogue of known messages.
//!
//! A receiver describes what it already holds as, for each group and
//! publisher, a list of inclusive sequence ranges. The sender turns that
//! into an exclusion list before replicating.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{MessageId, MessageKey, NodeId};

/// An inclusive range of sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    /// First seq in range.
    pub start: u64,
    /// Last seq in range.
    pub end: u64,
}

impl SeqRange {
    /// A range holding a single sequence number.
    pub const fn single(seq: u64) -> Self {
        Self { start: seq, end: seq }
    }

    /// Whether `seq` falls inside the range.
    pub fn contains(&self, seq: u64) -> bool {
        self.start <= seq && seq <= self.end
    }

    /// Count how many sequence numbers this represents.
    pub fn count(&self) -> u64 {
        if self.end >= self.start {
            self.end - self.start + 1
        } else {
            0
        }
    }
}

/// A sorted set of disjoint, non-adjacent sequence ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRanges {
    ranges: Vec<SeqRange>,
}

impl MessageRanges {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one sequence number, merging with neighbouring ranges.
    ///
    /// Returns `false` if the seq was already present.
    pub fn insert(&mut self, seq: u64) -> bool {
        // First range whose end is >= seq - 1 (i.e. that could absorb seq).
        let idx = self
            .ranges
            .partition_point(|r| r.end.saturating_add(1) < seq);

        if let Some(range) = self.ranges.get(idx) {
            if range.contains(seq) {
                return false;
            }
        }

        let joins_left = self
            .ranges
            .get(idx)
            .map_or(false, |r| r.end.checked_add(1) == Some(seq));
        let right_idx = if joins_left { idx + 1 } else { idx };
        let joins_right = self
            .ranges
            .get(right_idx)
            .map_or(false, |r| seq.checked_add(1) == Some(r.start));

        match (joins_left, joins_right) {
            (true, true) => {
                let right = self.ranges.remove(right_idx);
                self.ranges[idx].end = right.end;
            }
            (true, false) => self.ranges[idx].end = seq,
            (false, true) => self.ranges[right_idx].start = seq,
            (false, false) => self.ranges.insert(idx, SeqRange::single(seq)),
        }
        true
    }

    /// Whether `seq` is in the set.
    pub fn contains(&self, seq: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.end < seq);
        self.ranges.get(idx).map_or(false, |r| r.contains(seq))
    }

    /// The ranges, in ascending order.
    pub fn ranges(&self) -> &[SeqRange] {
        &self.ranges
    }

    /// Total number of sequence numbers covered.
    pub fn count(&self) -> u64 {
        self.ranges.iter().map(SeqRange::count).sum()
    }

    /// Whether no sequence number is covered.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Catalogue of messages a node already holds: group → publisher → ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownMessages {
    groups: BTreeMap<String, BTreeMap<NodeId, MessageRanges>>,
}

impl KnownMessages {
    /// Create an empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message given its structured key.
    pub fn insert(&mut self, key: &MessageKey) -> bool {
        self.groups
            .entry(key.group.clone())
            .or_default()
            .entry(key.publisher.clone())
            .or_default()
            .insert(key.seq)
    }

    /// Record a message by id. Opaque ids are ignored.
    pub fn insert_id(&mut self, id: &MessageId) -> bool {
        match id.key() {
            Some(key) => self.insert(&key),
            None => false,
        }
    }

    /// Whether the message identified by `key` is known.
    pub fn contains(&self, key: &MessageKey) -> bool {
        self.groups
            .get(&key.group)
            .and_then(|publishers| publishers.get(&key.publisher))
            .map_or(false, |ranges| ranges.contains(key.seq))
    }

    /// Whether the message is known. Opaque ids are never known.
    pub fn contains_id(&self, id: &MessageId) -> bool {
        id.key().map_or(false, |key| self.contains(&key))
    }

    /// Ranges recorded for a group and publisher.
    pub fn ranges(&self, group: &str, publisher: &NodeId) -> Option<&MessageRanges> {
        self.groups.get(group)?.get(publisher)
    }

    /// Groups present in the catalogue.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Keep only the given groups (empty slice keeps everything).
    pub fn restrict_to(&mut self, groups: &[String]) {
        if groups.is_empty() {
            return;
        }
        self.groups.retain(|group, _| groups.contains(group));
    }

    /// Total number of messages covered.
    pub fn count(&self) -> u64 {
        self.groups
            .values()
            .flat_map(BTreeMap::values)
            .map(MessageRanges::count)
            .sum()
    }

    /// Whether the catalogue covers no message.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}
