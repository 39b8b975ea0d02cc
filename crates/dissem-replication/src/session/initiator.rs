//! Initiator side of a replication session.

use std::sync::{Mutex, MutexGuard, PoisonError};

use dissem_core::{KnownMessages, NodeId};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Lifecycle of an initiator session. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    AwaitingAccept,
    Replicating,
    Terminating,
    Closed,
}

/// How an initiator session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every eligible message was handed to the gateway and the session was
    /// closed with a ReplicationEnd.
    Completed { replicated: usize },
    /// The target went away.
    TargetDied { replicated: usize },
    /// The target never accepted the session.
    HandshakeTimedOut,
    /// The ReplicationStart could not be sent.
    StartFailed(String),
    /// The manager shut down.
    Cancelled,
}

#[derive(Debug)]
struct SessionFields {
    state: SessionState,
    replicating: bool,
    target_dead: bool,
    exclude: Option<KnownMessages>,
    outcome: Option<SessionOutcome>,
    finished: bool,
}

/// Where the handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handshake {
    Waiting,
    Accepted,
    TargetDead,
}

/// A session replicating the local cache to one target.
///
/// The worker task owns the session's progress. Everything that happens
/// to the session from outside (reply, target death) goes through a
/// synchronized setter that wakes the worker.
#[derive(Debug)]
pub struct ReplicationSession {
    id: u64,
    local: NodeId,
    target: NodeId,
    check_target_for_messages: bool,
    require_acks: bool,
    fields: Mutex<SessionFields>,
    signal: Notify,
}

impl ReplicationSession {
    pub(crate) fn new(
        id: u64,
        local: NodeId,
        target: NodeId,
        check_target_for_messages: bool,
        require_acks: bool,
    ) -> Self {
        Self {
            id,
            local,
            target,
            check_target_for_messages,
            require_acks,
            fields: Mutex::new(SessionFields {
                state: SessionState::Idle,
                replicating: false,
                target_dead: false,
                exclude: None,
                outcome: None,
                finished: false,
            }),
            signal: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn check_target_for_messages(&self) -> bool {
        self.check_target_for_messages
    }

    pub fn require_acks(&self) -> bool {
        self.require_acks
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// How the session ended, once it has.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.lock().outcome.clone()
    }

    /// Whether the target ever accepted the session.
    pub fn has_replicated(&self) -> bool {
        self.lock().replicating
    }

    pub fn is_target_dead(&self) -> bool {
        self.lock().target_dead
    }

    /// Whether the worker is done with the session.
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Mark the target dead and wake the worker.
    pub fn target_died(&self) {
        self.lock().target_dead = true;
        self.signal.notify_waiters();
    }

    /// Record the target's accept reply and wake the worker.
    ///
    /// Returns `false` if the session was not waiting for one.
    pub fn reply_arrived(&self, known: Option<KnownMessages>) -> bool {
        {
            let mut fields = self.lock();
            if fields.state != SessionState::AwaitingAccept || fields.target_dead {
                return false;
            }
            fields.replicating = true;
            fields.state = SessionState::Replicating;
            if self.check_target_for_messages {
                fields.exclude = known;
            }
        }
        self.signal.notify_waiters();
        true
    }

    pub(crate) fn handshake(&self) -> Handshake {
        let fields = self.lock();
        if fields.target_dead {
            Handshake::TargetDead
        } else if fields.replicating {
            Handshake::Accepted
        } else {
            Handshake::Waiting
        }
    }

    /// A wake-up registered now sees every later setter call.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.signal.notified()
    }

    pub(crate) fn advance(&self, state: SessionState) {
        let mut fields = self.lock();
        if state > fields.state {
            fields.state = state;
        }
    }

    pub(crate) fn take_exclude(&self) -> Option<KnownMessages> {
        self.lock().exclude.take()
    }

    pub(crate) fn finish(&self, outcome: SessionOutcome) {
        let mut fields = self.lock();
        fields.outcome.get_or_insert(outcome);
        fields.finished = true;
        if fields.state < SessionState::Terminating {
            fields.state = SessionState::Terminating;
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionFields> {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dissem_core::MessageId;

    fn session(check: bool) -> ReplicationSession {
        ReplicationSession::new(1, NodeId::new("a"), NodeId::new("b"), check, true)
    }

    #[test]
    fn test_reply_only_accepted_while_waiting() {
        let s = session(true);
        assert!(!s.reply_arrived(None));
        s.advance(SessionState::AwaitingAccept);

        let mut known = KnownMessages::new();
        known.insert_id(&MessageId::new("g", &NodeId::new("p"), 1));
        assert!(s.reply_arrived(Some(known.clone())));
        assert_eq!(s.state(), SessionState::Replicating);
        assert_eq!(s.handshake(), Handshake::Accepted);
        assert_eq!(s.take_exclude(), Some(known));
        assert!(!s.reply_arrived(None));
    }

    #[test]
    fn test_exclusions_ignored_when_not_asked_for() {
        let s = session(false);
        s.advance(SessionState::AwaitingAccept);
        assert!(s.reply_arrived(Some(KnownMessages::new())));
        assert_eq!(s.take_exclude(), None);
    }

    #[test]
    fn test_dead_target_wins_over_reply() {
        let s = session(true);
        s.advance(SessionState::AwaitingAccept);
        s.target_died();
        assert!(!s.reply_arrived(None));
        assert_eq!(s.handshake(), Handshake::TargetDead);
    }

    #[test]
    fn test_state_never_regresses() {
        let s = session(true);
        s.advance(SessionState::Terminating);
        s.advance(SessionState::AwaitingAccept);
        assert_eq!(s.state(), SessionState::Terminating);

        s.finish(SessionOutcome::Cancelled);
        s.finish(SessionOutcome::HandshakeTimedOut);
        assert_eq!(s.outcome(), Some(SessionOutcome::Cancelled));
        assert!(s.is_finished());
    }
}
