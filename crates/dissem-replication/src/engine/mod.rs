//! Retransmission engine.
//!
//! Guarantees that messages sent with an ack requirement eventually reach
//! their targets. One dispatch task services peers round-robin from a work
//! queue: it retries expired messages, then tops up each peer's
//! transmission window.
//!
//! ## Locking
//!
//! All queues live under one mutex. The liveness tracker has its own lock
//! and is only taken after the queue lock. A service cycle decides what to
//! send while holding the queue lock and sends after releasing it, so the
//! lock is never held across an await.

mod queue;

pub use queue::{MessageState, TargetQueue, Transmission};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dissem_core::{ControlMessage, EngineConfig, MessageId, NodeId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::gateway::Gateway;
use crate::liveness::{LivenessChange, PeerLiveness};

#[derive(Debug, Default)]
struct EngineState {
    targets: HashMap<NodeId, TargetQueue>,
    work_queue: VecDeque<NodeId>,
}

impl EngineState {
    fn schedule(&mut self, peer: &NodeId) {
        if !self.work_queue.contains(peer) {
            self.work_queue.push_back(peer.clone());
        }
    }
}

/// What one service cycle decided to send to one peer.
struct Cycle {
    peer: NodeId,
    transmissions: Vec<Transmission>,
}

struct EngineInner<G: Gateway> {
    gateway: Arc<G>,
    liveness: Arc<PeerLiveness>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Reliable delivery of ack-required messages over a lossy mesh.
pub struct RetransmissionEngine<G: Gateway + 'static> {
    inner: Arc<EngineInner<G>>,
}

impl<G: Gateway + 'static> Clone for RetransmissionEngine<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: Gateway + 'static> RetransmissionEngine<G> {
    /// Create an engine. The dispatch task starts with the first request.
    pub fn new(gateway: Arc<G>, liveness: Arc<PeerLiveness>, config: EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                gateway,
                liveness,
                config,
                state: Mutex::new(EngineState::default()),
                dispatcher: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Ask for reliable delivery of `message` to `peer`.
    ///
    /// With `None` the peer is only scheduled for service.
    pub fn request_ack(&self, peer: &NodeId, message: Option<MessageId>) {
        {
            let mut state = self.inner.lock_state();
            let target = state.targets.entry(peer.clone()).or_default();
            if let Some(id) = message {
                if target.enqueue(id.clone()) {
                    trace!(peer = %peer, message = %id, "queued for reliable delivery");
                } else {
                    debug!(peer = %peer, message = %id, "already queued or in flight");
                }
            }
            state.schedule(peer);
        }
        self.ensure_dispatcher();
    }

    /// The peer acknowledged `message`.
    pub fn on_acknowledged(&self, message: &MessageId, peer: &NodeId) {
        let mut state = self.inner.lock_state();
        let acked = state
            .targets
            .get_mut(peer)
            .map_or(false, |target| target.acknowledge(message));
        if acked {
            debug!(peer = %peer, message = %message, "acknowledged");
        } else {
            info!(peer = %peer, message = %message, "ack for a message not in flight");
        }
    }

    /// The peer asked to pull the rest of `message` itself.
    pub fn on_requested(&self, message: &MessageId, peer: &NodeId) {
        let mut state = self.inner.lock_state();
        let suppressed = state
            .targets
            .get_mut(peer)
            .map_or(false, |target| target.suppress(message));
        if suppressed {
            debug!(peer = %peer, message = %message, "full resends suppressed");
        } else {
            info!(peer = %peer, message = %message, "request for a message not in flight");
        }
    }

    /// A neighbour (re)appeared; resume any parked work for it.
    pub fn new_neighbor(&self, peer: &NodeId) {
        self.inner.liveness.mark_new(peer);
        let resumed = {
            let mut state = self.inner.lock_state();
            let has_work = state
                .targets
                .get(peer)
                .map_or(false, |target| target.has_work());
            if has_work {
                state.schedule(peer);
            }
            has_work
        };
        if resumed {
            debug!(peer = %peer, "resuming delivery");
            self.ensure_dispatcher();
        }
    }

    /// A neighbour went away. Its queue is parked on its next service.
    pub fn dead_neighbor(&self, peer: &NodeId) {
        self.inner.liveness.mark_dead(peer);
    }

    /// Whether `message` is queued or in flight to `peer`.
    pub fn is_outstanding(&self, peer: &NodeId, message: &MessageId) -> bool {
        self.inner
            .lock_state()
            .targets
            .get(peer)
            .map_or(false, |target| target.contains(message))
    }

    /// Messages queued for `peer` but not sent yet.
    pub fn pending_work(&self, peer: &NodeId) -> usize {
        self.inner
            .lock_state()
            .targets
            .get(peer)
            .map_or(0, TargetQueue::unsent_len)
    }

    /// Messages sent to `peer` and not acknowledged yet.
    pub fn outstanding(&self, peer: &NodeId) -> usize {
        self.inner
            .lock_state()
            .targets
            .get(peer)
            .map_or(0, TargetQueue::unacknowledged_len)
    }

    /// Retransmission state of one in-flight message.
    pub fn message_state(&self, peer: &NodeId, message: &MessageId) -> Option<MessageState> {
        self.inner
            .lock_state()
            .targets
            .get(peer)
            .and_then(|target| target.state(message).cloned())
    }

    /// Whether the engine holds a queue for `peer`.
    pub fn is_tracking(&self, peer: &NodeId) -> bool {
        self.inner.lock_state().targets.contains_key(peer)
    }

    /// Whether the dispatch task is running.
    pub fn is_running(&self) -> bool {
        self.inner
            .lock_dispatcher()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Stop the dispatch task and wait for it.
    ///
    /// A send already in progress completes. Later requests are queued but
    /// never serviced.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.lock_dispatcher().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch task ended abnormally");
            }
        }
        info!("retransmission engine stopped");
    }

    fn ensure_dispatcher(&self) {
        if *self.inner.shutdown.borrow() {
            return;
        }
        let mut dispatcher = self.inner.lock_dispatcher();
        if dispatcher
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
        {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(&self.inner);
                let shutdown = self.inner.shutdown.subscribe();
                *dispatcher = Some(runtime.spawn(dispatch(inner, shutdown)));
                debug!("dispatch task started");
            }
            Err(_) => warn!("no runtime, dispatch deferred to the next request"),
        }
    }
}

impl<G: Gateway> EngineInner<G> {
    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dispatcher(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the next peer and decide what to send it.
    fn begin_cycle(&self, now: Instant) -> Option<Cycle> {
        let mut state = self.lock_state();
        let peer = state.work_queue.pop_front()?;
        let mut cycle = Cycle {
            peer,
            transmissions: Vec::new(),
        };
        let Some(target) = state.targets.get_mut(&cycle.peer) else {
            return Some(cycle);
        };

        match self.liveness.take_change(&cycle.peer) {
            Some(LivenessChange::New) => target.set_alive(true),
            Some(LivenessChange::Dead) => target.set_alive(false),
            None => {}
        }
        if !target.is_alive() {
            debug!(peer = %cycle.peer, "peer is dead, parking its queue");
            return Some(cycle);
        }

        cycle.transmissions = target.sweep(now, self.config.reenable_period);
        cycle.transmissions.extend(target.fill_window(
            self.config.transmission_window,
            now,
            self.config.ack_timeout(),
        ));
        Some(cycle)
    }

    async fn transmit(&self, cycle: &Cycle) {
        let peer = &cycle.peer;
        for transmission in &cycle.transmissions {
            if self.liveness.peek_change(peer) == Some(LivenessChange::Dead) {
                info!(peer = %peer, "peer died mid-cycle, deferring remaining sends");
                break;
            }

            let id = transmission.message_id();
            let result = match transmission {
                Transmission::Send(_) | Transmission::Resend(_) => {
                    self.gateway
                        .send_data(
                            id,
                            peer,
                            self.config.ack_timeout(),
                            self.config.priority,
                            true,
                        )
                        .await
                }
                Transmission::RequestCompletion(_) => {
                    let request = ControlMessage::MessageRequest {
                        message_id: id.clone(),
                    };
                    self.gateway.send_control(request, peer).await
                }
            };

            match result {
                Ok(()) => trace!(peer = %peer, message = %id, ?transmission, "sent"),
                Err(e) => {
                    warn!(peer = %peer, message = %id, error = %e, "send failed, retrying after timeout")
                }
            }
        }
    }

    /// Requeue the peer if it still has work, otherwise drop its queue.
    fn finish_cycle(&self, peer: &NodeId) {
        let mut state = self.lock_state();
        let Some(target) = state.targets.get(peer) else {
            return;
        };
        let (alive, has_work) = (target.is_alive(), target.has_work());

        if !has_work {
            state.targets.remove(peer);
            trace!(peer = %peer, "queue drained");
        } else if alive {
            state.schedule(peer);
        }
    }
}

async fn dispatch<G: Gateway + 'static>(
    inner: Arc<EngineInner<G>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match inner.begin_cycle(Instant::now()) {
            Some(cycle) => {
                inner.transmit(&cycle).await;
                let keep_running = pause(&mut shutdown, inner.config.busy_poll()).await;
                inner.finish_cycle(&cycle.peer);
                if !keep_running {
                    break;
                }
            }
            None => {
                if !pause(&mut shutdown, inner.config.idle_poll()).await {
                    break;
                }
            }
        }
    }
    debug!("dispatch task exiting");
}

/// Sleep unless shutdown is signalled first. Returns whether to continue.
pub(crate) async fn pause(shutdown: &mut watch::Receiver<bool>, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
