//! Per-peer transmission bookkeeping.
//!
//! Everything here is synchronous and clock-free: callers pass `now` in and
//! get back the transmissions to perform. The engine runs these under its
//! queue lock and does the sending after releasing it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dissem_core::MessageId;
use tokio::time::Instant;

/// Retransmission state of one sent, unacknowledged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageState {
    /// When the message (or a request for it) was last sent.
    pub sending_time: Instant,
    /// How long to wait for an ack after `sending_time`.
    pub timeout: Duration,
    /// Whether an expiry resends the full message.
    pub replication_enabled: bool,
    /// Expiries since the receiver last asked to pull the message itself.
    pub retry_counter: u8,
}

impl MessageState {
    fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            sending_time: now,
            timeout,
            replication_enabled: true,
            retry_counter: 0,
        }
    }

    /// Whether the ack deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.sending_time + self.timeout < now
    }
}

/// A send the engine must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmission {
    /// First transmission of a message, ack required.
    Send(MessageId),
    /// Full retransmission after an expired ack deadline.
    Resend(MessageId),
    /// Ask the receiver to pull the rest of a message it already knows.
    RequestCompletion(MessageId),
}

impl Transmission {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Transmission::Send(id) | Transmission::Resend(id) | Transmission::RequestCompletion(id) => {
                id
            }
        }
    }
}

/// Messages waiting for, or in, transmission to one peer.
#[derive(Debug)]
pub struct TargetQueue {
    unsent: VecDeque<MessageId>,
    unacknowledged: HashMap<MessageId, MessageState>,
    alive: AtomicBool,
}

impl Default for TargetQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetQueue {
    pub fn new() -> Self {
        Self {
            unsent: VecDeque::new(),
            unacknowledged: HashMap::new(),
            alive: AtomicBool::new(true),
        }
    }

    /// Queue a message. Returns `false` if it is already queued or in flight.
    pub fn enqueue(&mut self, message: MessageId) -> bool {
        if self.contains(&message) {
            return false;
        }
        self.unsent.push_back(message);
        true
    }

    /// Whether `message` is queued or awaiting an ack.
    pub fn contains(&self, message: &MessageId) -> bool {
        self.unacknowledged.contains_key(message) || self.unsent.contains(message)
    }

    /// Retry every expired message.
    ///
    /// A message whose receiver asked to pull it is only nudged with a
    /// completion request, except every `reenable_period`-th expiry which
    /// forces a full resend.
    pub fn sweep(&mut self, now: Instant, reenable_period: u8) -> Vec<Transmission> {
        let mut expired: Vec<(Instant, MessageId)> = self
            .unacknowledged
            .iter()
            .filter(|(_, state)| state.is_expired(now))
            .map(|(id, state)| (state.sending_time, id.clone()))
            .collect();
        expired.sort();

        let mut transmissions = Vec::with_capacity(expired.len());
        for (_, id) in expired {
            let Some(state) = self.unacknowledged.get_mut(&id) else {
                continue;
            };
            state.sending_time = now;
            if state.replication_enabled {
                transmissions.push(Transmission::Resend(id));
                continue;
            }

            state.retry_counter = state.retry_counter.saturating_add(1);
            if state.retry_counter >= reenable_period {
                state.replication_enabled = true;
                state.retry_counter = 0;
                transmissions.push(Transmission::Resend(id));
            } else {
                transmissions.push(Transmission::RequestCompletion(id));
            }
        }
        transmissions
    }

    /// Move queued messages into flight until the window is full.
    pub fn fill_window(
        &mut self,
        window: usize,
        now: Instant,
        timeout: Duration,
    ) -> Vec<Transmission> {
        let mut transmissions = Vec::new();
        while self.unacknowledged.len() < window {
            let Some(id) = self.unsent.pop_front() else {
                break;
            };
            self.unacknowledged
                .insert(id.clone(), MessageState::new(now, timeout));
            transmissions.push(Transmission::Send(id));
        }
        transmissions
    }

    /// Drop the state of an acknowledged message.
    pub fn acknowledge(&mut self, message: &MessageId) -> bool {
        self.unacknowledged.remove(message).is_some()
    }

    /// Stop full resends of `message`; the receiver will pull it.
    pub fn suppress(&mut self, message: &MessageId) -> bool {
        match self.unacknowledged.get_mut(message) {
            Some(state) => {
                state.replication_enabled = false;
                state.retry_counter = 0;
                true
            }
            None => false,
        }
    }

    pub fn state(&self, message: &MessageId) -> Option<&MessageState> {
        self.unacknowledged.get(message)
    }

    pub fn has_work(&self) -> bool {
        !self.unsent.is_empty() || !self.unacknowledged.is_empty()
    }

    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    pub fn unacknowledged_len(&self) -> usize {
        self.unacknowledged.len()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }
}
