//! Peer liveness tracking.
//!
//! Neighbour discovery reports peers coming and going. Those events are
//! recorded here and consumed later by whoever services the peer, so the
//! discovery path never waits on replication work.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dissem_core::NodeId;

/// A liveness event not yet consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessChange {
    /// The peer (re)appeared.
    New,
    /// The peer went away.
    Dead,
}

#[derive(Debug, Default)]
struct LivenessSets {
    recently_new: HashSet<NodeId>,
    recently_dead: HashSet<NodeId>,
    live: HashSet<NodeId>,
}

/// Tracks which peers recently appeared or disappeared.
///
/// A peer is never in both the new and the dead set. Marking is idempotent.
#[derive(Debug, Default)]
pub struct PeerLiveness {
    sets: Mutex<LivenessSets>,
}

impl PeerLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` appeared.
    pub fn mark_new(&self, peer: &NodeId) {
        let mut sets = self.lock();
        sets.recently_dead.remove(peer);
        sets.recently_new.insert(peer.clone());
        sets.live.insert(peer.clone());
    }

    /// Record that `peer` went away.
    pub fn mark_dead(&self, peer: &NodeId) {
        let mut sets = self.lock();
        sets.recently_new.remove(peer);
        sets.recently_dead.insert(peer.clone());
        sets.live.remove(peer);
    }

    /// Consume the pending event for `peer`, if any.
    pub fn take_change(&self, peer: &NodeId) -> Option<LivenessChange> {
        let mut sets = self.lock();
        if sets.recently_dead.remove(peer) {
            Some(LivenessChange::Dead)
        } else if sets.recently_new.remove(peer) {
            Some(LivenessChange::New)
        } else {
            None
        }
    }

    /// Look at the pending event for `peer` without consuming it.
    pub fn peek_change(&self, peer: &NodeId) -> Option<LivenessChange> {
        let sets = self.lock();
        if sets.recently_dead.contains(peer) {
            Some(LivenessChange::Dead)
        } else if sets.recently_new.contains(peer) {
            Some(LivenessChange::New)
        } else {
            None
        }
    }

    /// Whether `peer` is currently a live neighbour.
    pub fn is_alive(&self, peer: &NodeId) -> bool {
        self.lock().live.contains(peer)
    }

    /// Current live neighbours, sorted.
    pub fn live_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.lock().live.iter().cloned().collect();
        peers.sort();
        peers
    }

    fn lock(&self) -> MutexGuard<'_, LivenessSets> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
