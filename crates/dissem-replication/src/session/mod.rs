//! Target-based replication sessions.
//!
//! When a selected neighbour appears, this node opens a session with it:
//! a handshake (`ReplicationStart` / `ReplicationStartReply`), then every
//! cached message the target lacks, then `ReplicationEnd`. The target acks
//! what it completes in batches.
//!
//! ## Message Flow
//!
//! ```text
//! Initiator                          Target
//!   |-------- ReplicationStart ------->|
//!   |<------- ReplicationStartReply ---|   (known messages)
//!   |======== data ===================>|
//!   |<------- BatchAck ----------------|
//!   |======== data ===================>|
//!   |-------- ReplicationEnd --------->|
//!   |<------- BatchAck ----------------|   (final partial batch)
//! ```
//!
//! ## Concurrency
//!
//! Active initiators, terminating initiators, pending destinations, active
//! receivers and pending sources each sit behind their own mutex and no
//! code path holds two of them at once. Starting sessions is single-flight
//! per side, which is what keeps serial mode down to one active session.

mod initiator;
mod receiver;

pub use initiator::{ReplicationSession, SessionOutcome, SessionState};
pub use receiver::ReceiverSession;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dissem_cache::{CachedMessage, DataCache};
use dissem_core::{
    limits, ControlMessage, KnownMessages, MessageId, NodeId, SessionConfig, PROTOCOL_VERSION,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::pause;
use crate::gateway::Gateway;
use initiator::Handshake;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ManagerInner<G: Gateway, C: DataCache> {
    local: NodeId,
    gateway: Arc<G>,
    cache: Arc<C>,
    config: SessionConfig,
    replicators: Mutex<HashMap<NodeId, Arc<ReplicationSession>>>,
    terminating: Mutex<Vec<Arc<ReplicationSession>>>,
    pending_destinations: Mutex<VecDeque<NodeId>>,
    receivers: Mutex<HashMap<NodeId, ReceiverSession>>,
    pending_sources: Mutex<VecDeque<ReceiverSession>>,
    scheduling_replication: AtomicBool,
    scheduling_reception: AtomicBool,
    next_session_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Runs replication sessions to selected targets and answers sessions
/// opened by other nodes.
pub struct SessionManager<G: Gateway + 'static, C: DataCache + 'static> {
    inner: Arc<ManagerInner<G, C>>,
}

impl<G: Gateway + 'static, C: DataCache + 'static> Clone for SessionManager<G, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: Gateway + 'static, C: DataCache + 'static> SessionManager<G, C> {
    pub fn new(gateway: Arc<G>, cache: Arc<C>, config: SessionConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                local: gateway.local_node_id(),
                gateway,
                cache,
                config,
                replicators: Mutex::new(HashMap::new()),
                terminating: Mutex::new(Vec::new()),
                pending_destinations: Mutex::new(VecDeque::new()),
                receivers: Mutex::new(HashMap::new()),
                pending_sources: Mutex::new(VecDeque::new()),
                scheduling_replication: AtomicBool::new(false),
                scheduling_reception: AtomicBool::new(false),
                next_session_id: AtomicU64::new(1),
                workers: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// A neighbour appeared. Opens a session if it is a selected target.
    ///
    /// Returns whether a session was queued.
    pub fn new_neighbor(&self, peer: &NodeId) -> bool {
        if !self.inner.config.targets.selects(peer) {
            debug!(peer = %peer, "not a replication target");
            return false;
        }
        self.inner.enqueue_destination(peer)
    }

    /// Open a session to `peer` regardless of the target filter.
    pub fn replicate_to(&self, peer: &NodeId) -> bool {
        self.inner.enqueue_destination(peer)
    }

    /// A neighbour went away. Ends every session with it.
    pub fn dead_neighbor(&self, peer: &NodeId) {
        let inner = &self.inner;

        let session = lock(&inner.replicators).remove(peer);
        if let Some(session) = &session {
            info!(peer = %peer, session = session.id(), "target died, terminating session");
            session.target_died();
            session.advance(SessionState::Terminating);
            lock(&inner.terminating).push(Arc::clone(session));
        }
        lock(&inner.pending_destinations).retain(|pending| pending != peer);

        let receiver = lock(&inner.receivers).remove(peer);
        if let Some(receiver) = &receiver {
            info!(
                peer = %peer,
                session = receiver.id(),
                dropped_acks = receiver.pending_acks().len(),
                "source died, dropping receiver session"
            );
        }
        lock(&inner.pending_sources).retain(|pending| pending.source() != peer);

        inner.cleanup_terminated();
        if session.is_some() {
            inner.schedule_replication();
        }
        if receiver.is_some() {
            inner.schedule_reception();
        }
    }

    /// Handle a control message from `sender`.
    pub async fn on_control(&self, sender: &NodeId, message: ControlMessage) {
        if let Some(version) = message.protocol_version() {
            if version != PROTOCOL_VERSION {
                warn!(
                    peer = %sender,
                    kind = message.kind(),
                    version,
                    expected = PROTOCOL_VERSION,
                    "protocol version mismatch, ignoring"
                );
                return;
            }
        }

        match message {
            ControlMessage::ReplicationStart {
                send_current_data_list,
                require_acks,
                groups,
                ..
            } => self
                .inner
                .accept_start(sender, send_current_data_list, require_acks, groups),
            ControlMessage::ReplicationStartReply { known, .. } => {
                self.inner.accept_reply(sender, known)
            }
            ControlMessage::ReplicationEnd { .. } => self.inner.end_reception(sender).await,
            ControlMessage::BatchAck { message_ids, .. } => {
                self.inner.record_batch_ack(sender, &message_ids).await
            }
            other => debug!(peer = %sender, kind = other.kind(), "not a session message"),
        }
    }

    /// A message was added to the local cache. Counts toward the ack
    /// batches of every receiver session that wants acks.
    pub async fn on_cache_updated(&self, message: &CachedMessage) {
        if !message.complete {
            return;
        }
        let now = Instant::now();
        let batches: Vec<(NodeId, Vec<MessageId>)> = lock(&self.inner.receivers)
            .values_mut()
            .filter_map(|session| {
                session
                    .record(message.id.clone(), now)
                    .map(|batch| (session.source().clone(), batch))
            })
            .collect();

        for (source, batch) in batches {
            self.inner.send_batch_ack(&source, batch).await;
        }
    }

    /// Release terminating sessions whose workers are done.
    ///
    /// Returns how many are still winding down.
    pub fn cleanup_terminated(&self) -> usize {
        self.inner.cleanup_terminated()
    }

    /// The active session to `peer`, if any.
    pub fn session(&self, peer: &NodeId) -> Option<Arc<ReplicationSession>> {
        lock(&self.inner.replicators).get(peer).cloned()
    }

    /// Targets with an active session, sorted.
    pub fn active_replications(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = lock(&self.inner.replicators).keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Targets waiting for a session, in order.
    pub fn pending_destinations(&self) -> Vec<NodeId> {
        lock(&self.inner.pending_destinations)
            .iter()
            .cloned()
            .collect()
    }

    pub fn terminating_count(&self) -> usize {
        lock(&self.inner.terminating).len()
    }

    /// Sources with an active receiver session, sorted.
    pub fn active_receptions(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = lock(&self.inner.receivers).keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Sources waiting for a receiver session, in order.
    pub fn pending_sources(&self) -> Vec<NodeId> {
        lock(&self.inner.pending_sources)
            .iter()
            .map(|session| session.source().clone())
            .collect()
    }

    /// Acks held back for `source`.
    pub fn pending_acks(&self, source: &NodeId) -> usize {
        lock(&self.inner.receivers)
            .get(source)
            .map_or(0, |session| session.pending_acks().len())
    }

    /// Stop every session worker and wait for them.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let workers = std::mem::take(&mut *lock(&self.inner.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "session worker ended abnormally");
            }
        }
        self.inner.cleanup_terminated();
        info!(node = %self.inner.local, "session manager stopped");
    }
}

impl<G: Gateway + 'static, C: DataCache + 'static> ManagerInner<G, C> {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn next_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue_destination(self: &Arc<Self>, peer: &NodeId) -> bool {
        if peer == &self.local {
            return false;
        }
        if lock(&self.replicators).contains_key(peer) {
            warn!(peer = %peer, "session already active, ignoring");
            return false;
        }
        {
            let mut pending = lock(&self.pending_destinations);
            if pending.contains(peer) {
                warn!(peer = %peer, "session already pending, ignoring");
                return false;
            }
            pending.push_back(peer.clone());
        }
        debug!(peer = %peer, "replication target queued");
        self.schedule_replication();
        true
    }

    fn spawn<F>(&self, worker: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(worker);
                let mut workers = lock(&self.workers);
                workers.retain(|worker| !worker.is_finished());
                workers.push(handle);
                true
            }
            Err(_) => {
                warn!("no runtime, cannot start session worker");
                false
            }
        }
    }

    // Initiator side

    fn schedule_replication(self: &Arc<Self>) {
        loop {
            if self.scheduling_replication.swap(true, Ordering::SeqCst) {
                return;
            }
            self.start_pending_replications();
            self.scheduling_replication.store(false, Ordering::SeqCst);

            let waiting = !lock(&self.pending_destinations).is_empty();
            if !waiting
                || !(self.config.concurrent_replication || lock(&self.replicators).is_empty())
                || self.is_shutting_down()
            {
                return;
            }
        }
    }

    fn start_pending_replications(self: &Arc<Self>) {
        if self.is_shutting_down() {
            return;
        }
        if self.config.concurrent_replication {
            loop {
                let next = lock(&self.pending_destinations).pop_front();
                let Some(peer) = next else {
                    break;
                };
                self.start_replication(peer);
            }
        } else if lock(&self.replicators).is_empty() {
            let next = lock(&self.pending_destinations).pop_front();
            if let Some(peer) = next {
                self.start_replication(peer);
            }
        }
    }

    fn start_replication(self: &Arc<Self>, peer: NodeId) {
        let session = Arc::new(ReplicationSession::new(
            self.next_id(),
            self.local.clone(),
            peer.clone(),
            self.config.check_target_for_messages,
            self.config.require_acks,
        ));
        {
            let mut replicators = lock(&self.replicators);
            if replicators.contains_key(&peer) {
                debug!(peer = %peer, "session already active");
                return;
            }
            replicators.insert(peer.clone(), Arc::clone(&session));
        }

        info!(peer = %peer, session = session.id(), "starting replication session");
        let worker = Arc::clone(self).run_initiator(Arc::clone(&session), self.shutdown.subscribe());
        if !self.spawn(worker) {
            lock(&self.replicators).remove(&peer);
        }
    }

    async fn run_initiator(
        self: Arc<Self>,
        session: Arc<ReplicationSession>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let outcome = self.replicate(&session, &mut shutdown).await;
        info!(
            peer = %session.target(),
            session = session.id(),
            ?outcome,
            "replication session finished"
        );
        self.retire(&session, outcome);
    }

    async fn replicate(
        &self,
        session: &ReplicationSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionOutcome {
        let target = session.target();
        session.advance(SessionState::AwaitingAccept);

        let start = ControlMessage::ReplicationStart {
            protocol_version: PROTOCOL_VERSION,
            send_current_data_list: session.check_target_for_messages(),
            require_acks: session.require_acks(),
            groups: self.config.groups.clone(),
        };
        if let Err(e) = self.gateway.send_control(start, target).await {
            warn!(peer = %target, error = %e, "could not send replication start");
            return SessionOutcome::StartFailed(e.to_string());
        }

        if let Err(outcome) = self.await_accept(session, shutdown).await {
            return outcome;
        }

        let exclude = session.take_exclude();
        let ids = match self
            .cache
            .not_replicated(target, &self.config.groups, exclude.as_ref())
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(peer = %target, error = %e, "could not list messages to replicate");
                Vec::new()
            }
        };
        debug!(peer = %target, count = ids.len(), "replicating");

        // Acks for session data come back batched, never per message.
        let mut replicated = 0;
        for id in ids {
            if !self.wait_clear_to_send(session, shutdown).await {
                break;
            }
            match self
                .gateway
                .send_data(
                    &id,
                    target,
                    self.config.data_send_timeout(),
                    self.config.priority,
                    false,
                )
                .await
            {
                Ok(()) => {
                    replicated += 1;
                    if !session.require_acks() {
                        if let Err(e) = self.cache.record_replicated(&id, target).await {
                            warn!(peer = %target, message = %id, error = %e, "could not record delivery");
                        }
                    }
                }
                Err(e) => warn!(peer = %target, message = %id, error = %e, "replication send failed"),
            }
        }

        if *shutdown.borrow() {
            return SessionOutcome::Cancelled;
        }
        if session.is_target_dead() {
            return SessionOutcome::TargetDied { replicated };
        }

        let end = ControlMessage::ReplicationEnd {
            protocol_version: PROTOCOL_VERSION,
        };
        if let Err(e) = self.gateway.send_control(end, target).await {
            warn!(peer = %target, error = %e, "could not send replication end");
        }
        SessionOutcome::Completed { replicated }
    }

    /// Wait for the accept reply, target death, shutdown or the deadline.
    async fn await_accept(
        &self,
        session: &ReplicationSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionOutcome> {
        let deadline = Instant::now() + self.config.session_ack_timeout();
        loop {
            let notified = session.notified();
            match session.handshake() {
                Handshake::Accepted => return Ok(()),
                Handshake::TargetDead => return Err(SessionOutcome::TargetDied { replicated: 0 }),
                Handshake::Waiting => {}
            }
            if *shutdown.borrow() {
                return Err(SessionOutcome::Cancelled);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if session.handshake() == Handshake::Waiting {
                        warn!(peer = %session.target(), session = session.id(), "no reply to replication start");
                        return Err(SessionOutcome::HandshakeTimedOut);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Err(SessionOutcome::Cancelled);
                    }
                }
            }
        }
    }

    /// Hold off while the gateway is saturated. `false` if the session
    /// should stop instead.
    async fn wait_clear_to_send(
        &self,
        session: &ReplicationSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            if session.is_target_dead() || *shutdown.borrow() {
                return false;
            }
            if self.gateway.clear_to_send().await {
                return true;
            }
            if !pause(shutdown, self.config.flow_control_poll()).await {
                return false;
            }
        }
    }

    /// Move a finished session to the terminating list and start the next.
    fn retire(self: &Arc<Self>, session: &Arc<ReplicationSession>, outcome: SessionOutcome) {
        session.finish(outcome);
        {
            let mut replicators = lock(&self.replicators);
            let current = replicators
                .get(session.target())
                .map_or(false, |active| Arc::ptr_eq(active, session));
            if current {
                replicators.remove(session.target());
            }
        }
        {
            let mut terminating = lock(&self.terminating);
            if !terminating.iter().any(|held| Arc::ptr_eq(held, session)) {
                terminating.push(Arc::clone(session));
            }
        }
        self.cleanup_terminated();
        self.schedule_replication();
    }

    fn cleanup_terminated(&self) -> usize {
        let mut terminating = lock(&self.terminating);
        terminating.retain(|session| {
            if session.is_finished() {
                session.advance(SessionState::Closed);
                debug!(peer = %session.target(), session = session.id(), "session closed");
                false
            } else {
                true
            }
        });
        terminating.len()
    }

    // Receiver side

    fn accept_start(
        self: &Arc<Self>,
        source: &NodeId,
        send_current_data_list: bool,
        require_acks: bool,
        groups: Vec<String>,
    ) {
        if lock(&self.receivers).remove(source).is_some() {
            warn!(peer = %source, "replacing active receiver session");
        }
        let session = ReceiverSession::new(
            self.next_id(),
            self.local.clone(),
            source.clone(),
            send_current_data_list,
            require_acks,
            groups,
            self.config.ack_batch_size,
            self.config.ack_cycle(),
            Instant::now(),
        );
        {
            let mut pending = lock(&self.pending_sources);
            if let Some(position) = pending.iter().position(|held| held.source() == source) {
                warn!(peer = %source, "replacing pending receiver session");
                pending.remove(position);
            }
            pending.push_back(session);
        }
        self.schedule_reception();
    }

    fn schedule_reception(self: &Arc<Self>) {
        loop {
            if self.scheduling_reception.swap(true, Ordering::SeqCst) {
                return;
            }
            self.start_pending_receptions();
            self.scheduling_reception.store(false, Ordering::SeqCst);

            let waiting = !lock(&self.pending_sources).is_empty();
            if !waiting
                || !(self.config.concurrent_reception || lock(&self.receivers).is_empty())
                || self.is_shutting_down()
            {
                return;
            }
        }
    }

    fn start_pending_receptions(self: &Arc<Self>) {
        if self.is_shutting_down() {
            return;
        }
        if self.config.concurrent_reception {
            loop {
                let next = lock(&self.pending_sources).pop_front();
                let Some(session) = next else {
                    break;
                };
                self.start_reception(session);
            }
        } else if lock(&self.receivers).is_empty() {
            let next = lock(&self.pending_sources).pop_front();
            if let Some(session) = next {
                self.start_reception(session);
            }
        }
    }

    fn start_reception(self: &Arc<Self>, session: ReceiverSession) {
        let source = session.source().clone();
        let id = session.id();
        let send_list = session.send_current_data_list();
        let generate_acks = session.generate_acks();
        let groups = session.groups().to_vec();

        lock(&self.receivers).insert(source.clone(), session);
        info!(peer = %source, session = id, "accepting replication session");

        let worker = Arc::clone(self).run_receiver(
            source.clone(),
            id,
            send_list,
            generate_acks,
            groups,
            self.shutdown.subscribe(),
        );
        if !self.spawn(worker) {
            lock(&self.receivers).remove(&source);
        }
    }

    async fn run_receiver(
        self: Arc<Self>,
        source: NodeId,
        id: u64,
        send_list: bool,
        generate_acks: bool,
        groups: Vec<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let known = if send_list {
            self.known_for_reply(&groups).await
        } else {
            None
        };
        let reply = ControlMessage::ReplicationStartReply {
            protocol_version: PROTOCOL_VERSION,
            known,
        };
        if let Err(e) = self.gateway.send_control(reply, &source).await {
            warn!(peer = %source, error = %e, "could not send replication start reply");
        }

        if !generate_acks {
            return;
        }

        while pause(&mut shutdown, self.config.ack_cycle()).await {
            let batch = {
                let mut receivers = lock(&self.receivers);
                match receivers.get_mut(&source) {
                    Some(session) if session.id() == id => session.flush_due(Instant::now()),
                    _ => break,
                }
            };
            if let Some(batch) = batch {
                self.send_batch_ack(&source, batch).await;
            }
        }
        debug!(peer = %source, session = id, "receiver worker exiting");
    }

    async fn known_for_reply(&self, groups: &[String]) -> Option<KnownMessages> {
        match self.cache.known_messages(groups).await {
            Ok(known) if known.groups().count() > limits::MAX_KNOWN_GROUPS => {
                warn!(groups = known.groups().count(), "too many known groups to report");
                None
            }
            Ok(known) => Some(known),
            Err(e) => {
                warn!(error = %e, "could not list known messages");
                None
            }
        }
    }

    fn accept_reply(&self, sender: &NodeId, known: Option<KnownMessages>) {
        let session = lock(&self.replicators).get(sender).cloned();
        let Some(session) = session else {
            warn!(peer = %sender, "start reply without a session");
            return;
        };
        if session.reply_arrived(known) {
            info!(peer = %sender, session = session.id(), "target accepted session");
        } else {
            warn!(peer = %sender, session = session.id(), state = ?session.state(), "unexpected start reply");
        }
    }

    async fn end_reception(self: &Arc<Self>, source: &NodeId) {
        let removed = lock(&self.receivers).remove(source);
        match removed {
            Some(mut session) => {
                info!(peer = %source, session = session.id(), "replication session ended by source");
                if let Some(batch) = session.drain(Instant::now()) {
                    self.send_batch_ack(source, batch).await;
                }
            }
            None => warn!(peer = %source, "replication end without a session"),
        }
        self.schedule_reception();
    }

    async fn send_batch_ack(&self, source: &NodeId, batch: Vec<MessageId>) {
        for chunk in batch.chunks(limits::MAX_ACK_IDS) {
            let ack = ControlMessage::BatchAck {
                protocol_version: PROTOCOL_VERSION,
                message_ids: chunk.to_vec(),
            };
            match self.gateway.send_control(ack, source).await {
                Ok(()) => debug!(peer = %source, count = chunk.len(), "batch ack sent"),
                Err(e) => warn!(peer = %source, error = %e, "could not send batch ack"),
            }
        }
    }

    async fn record_batch_ack(&self, target: &NodeId, message_ids: &[MessageId]) {
        for id in message_ids {
            if let Err(e) = self.cache.record_replicated(id, target).await {
                warn!(peer = %target, message = %id, error = %e, "could not record delivery");
            }
        }
        debug!(peer = %target, count = message_ids.len(), "batch ack recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::{Inbound, MemoryGateway, MemoryMesh};
    use dissem_cache::MemoryCache;
    use dissem_core::TargetFilter;
    use std::time::Duration;
    use tokio::time::sleep;

    fn msg(publisher: &str, seq: u64) -> CachedMessage {
        CachedMessage::complete(
            MessageId::new("tracks", &NodeId::new(publisher), seq),
            "tracks",
            vec![seq as u8],
        )
    }

    fn drain(gateway: &MemoryGateway) -> Vec<Inbound> {
        let mut inbound = Vec::new();
        while let Some(delivery) = gateway.try_recv() {
            inbound.push(delivery.unwrap().1);
        }
        inbound
    }

    fn everyone() -> SessionConfig {
        SessionConfig {
            targets: TargetFilter::everyone(),
            ..SessionConfig::default()
        }
    }

    struct Node {
        manager: SessionManager<MemoryGateway, MemoryCache>,
        gateway: Arc<MemoryGateway>,
        cache: Arc<MemoryCache>,
    }

    async fn node(mesh: &Arc<MemoryMesh>, name: &str, config: SessionConfig) -> Node {
        let gateway = Arc::new(mesh.create_gateway(NodeId::new(name)).await);
        let cache = Arc::new(MemoryCache::new());
        let manager = SessionManager::new(Arc::clone(&gateway), Arc::clone(&cache), config);
        Node {
            manager,
            gateway,
            cache,
        }
    }

    fn reply(known: Option<KnownMessages>) -> ControlMessage {
        ControlMessage::ReplicationStartReply {
            protocol_version: PROTOCOL_VERSION,
            known,
        }
    }

    fn start(require_acks: bool) -> ControlMessage {
        ControlMessage::ReplicationStart {
            protocol_version: PROTOCOL_VERSION,
            send_current_data_list: true,
            require_acks,
            groups: Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_terminates_without_replicating() {
        let mesh = MemoryMesh::new();
        let a = node(&mesh, "a", everyone()).await;
        let b = mesh.create_gateway(NodeId::new("b")).await;
        let peer = NodeId::new("b");

        assert!(a.manager.new_neighbor(&peer));
        sleep(Duration::from_millis(10)).await;
        let session = a.manager.session(&peer).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingAccept);
        assert!(matches!(
            drain(&b).as_slice(),
            [Inbound::Control(ControlMessage::ReplicationStart { .. })]
        ));

        sleep(Duration::from_secs(61)).await;
        assert_eq!(session.outcome(), Some(SessionOutcome::HandshakeTimedOut));
        assert!(!session.has_replicated());
        assert!(a.manager.session(&peer).is_none());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(a.manager.terminating_count(), 0);

        assert!(a.manager.new_neighbor(&peer));
        sleep(Duration::from_millis(10)).await;
        assert!(a.manager.session(&peer).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_replicates_missing_messages() {
        let mesh = MemoryMesh::new();
        let a = node(&mesh, "a", everyone()).await;
        let b = mesh.create_gateway(NodeId::new("b")).await;
        let peer = NodeId::new("b");
        for seq in 1..=3 {
            a.cache.insert(msg("a", seq)).unwrap();
        }

        a.manager.new_neighbor(&peer);
        sleep(Duration::from_millis(10)).await;
        drain(&b);
        let session = a.manager.session(&peer).unwrap();

        let mut known = KnownMessages::new();
        known.insert_id(&msg("a", 2).id);
        a.manager.on_control(&peer, reply(Some(known))).await;
        sleep(Duration::from_millis(10)).await;

        let inbound = drain(&b);
        let data: Vec<MessageId> = inbound
            .iter()
            .filter_map(|delivery| match delivery {
                Inbound::Data { message_id, require_ack } => {
                    assert!(!*require_ack);
                    Some(message_id.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(data, vec![msg("a", 1).id, msg("a", 3).id]);
        assert!(matches!(
            inbound.last(),
            Some(Inbound::Control(ControlMessage::ReplicationEnd { .. }))
        ));
        assert_eq!(
            session.outcome(),
            Some(SessionOutcome::Completed { replicated: 2 })
        );

        // Acks are required, so nothing is recorded until the batch ack.
        assert!(!a.cache.was_replicated(&msg("a", 1).id, &peer).await.unwrap());
        a.manager
            .on_control(
                &peer,
                ControlMessage::BatchAck {
                    protocol_version: PROTOCOL_VERSION,
                    message_ids: vec![msg("a", 1).id, msg("a", 3).id],
                },
            )
            .await;
        assert!(a.cache.was_replicated(&msg("a", 1).id, &peer).await.unwrap());
        assert!(a.cache.was_replicated(&msg("a", 3).id, &peer).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_acks_deliveries_are_recorded_immediately() {
        let mesh = MemoryMesh::new();
        let config = SessionConfig {
            require_acks: false,
            ..everyone()
        };
        let a = node(&mesh, "a", config).await;
        let _b = mesh.create_gateway(NodeId::new("b")).await;
        let peer = NodeId::new("b");
        a.cache.insert(msg("a", 1)).unwrap();

        a.manager.new_neighbor(&peer);
        sleep(Duration::from_millis(10)).await;
        a.manager.on_control(&peer, reply(None)).await;
        sleep(Duration::from_millis(10)).await;

        assert!(a.cache.was_replicated(&msg("a", 1).id, &peer).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_mode_runs_one_session_at_a_time() {
        let mesh = MemoryMesh::new();
        let a = node(&mesh, "a", everyone()).await;
        let _b = mesh.create_gateway(NodeId::new("b")).await;
        let _c = mesh.create_gateway(NodeId::new("c")).await;
        let (b, c) = (NodeId::new("b"), NodeId::new("c"));

        a.manager.new_neighbor(&b);
        a.manager.new_neighbor(&c);
        assert!(!a.manager.new_neighbor(&c));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(a.manager.active_replications(), vec![b.clone()]);
        assert_eq!(a.manager.pending_destinations(), vec![c.clone()]);

        a.manager.on_control(&b, reply(None)).await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(a.manager.active_replications(), vec![c]);
        assert!(a.manager.pending_destinations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_mode_starts_all() {
        let mesh = MemoryMesh::new();
        let config = SessionConfig {
            concurrent_replication: true,
            ..everyone()
        };
        let a = node(&mesh, "a", config).await;
        let _b = mesh.create_gateway(NodeId::new("b")).await;
        let _c = mesh.create_gateway(NodeId::new("c")).await;

        a.manager.new_neighbor(&NodeId::new("b"));
        a.manager.new_neighbor(&NodeId::new("c"));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            a.manager.active_replications(),
            vec![NodeId::new("b"), NodeId::new("c")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_filter() {
        let mesh = MemoryMesh::new();
        let config = SessionConfig {
            targets: TargetFilter::from_lists("gw-*", "gw-9"),
            ..SessionConfig::default()
        };
        let a = node(&mesh, "a", config).await;

        assert!(!a.manager.new_neighbor(&NodeId::new("uav-1")));
        assert!(!a.manager.new_neighbor(&NodeId::new("gw-9")));
        assert!(a.manager.replicate_to(&NodeId::new("uav-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_target_wakes_waiting_session() {
        let mesh = MemoryMesh::new();
        let a = node(&mesh, "a", everyone()).await;
        let b = mesh.create_gateway(NodeId::new("b")).await;
        let peer = NodeId::new("b");

        a.manager.new_neighbor(&peer);
        sleep(Duration::from_millis(10)).await;
        let session = a.manager.session(&peer).unwrap();
        drain(&b);

        let began = Instant::now();
        a.manager.dead_neighbor(&peer);
        sleep(Duration::from_millis(10)).await;

        assert!(began.elapsed() < Duration::from_secs(1));
        assert_eq!(
            session.outcome(),
            Some(SessionOutcome::TargetDied { replicated: 0 })
        );
        assert!(session.state() >= SessionState::Terminating);
        assert!(a.manager.session(&peer).is_none());
        assert!(drain(&b).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_control_pauses_replication() {
        let mesh = MemoryMesh::new();
        let a = node(&mesh, "a", everyone()).await;
        let b = mesh.create_gateway(NodeId::new("b")).await;
        let peer = NodeId::new("b");
        a.cache.insert(msg("a", 1)).unwrap();

        a.manager.new_neighbor(&peer);
        sleep(Duration::from_millis(10)).await;
        drain(&b);

        a.gateway.set_congested(true);
        a.manager.on_control(&peer, reply(None)).await;
        sleep(Duration::from_millis(500)).await;
        assert!(drain(&b).is_empty());

        a.gateway.set_congested(false);
        sleep(Duration::from_millis(200)).await;
        assert!(matches!(drain(&b).first(), Some(Inbound::Data { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_replies_with_known_messages() {
        let mesh = MemoryMesh::new();
        let r = node(&mesh, "r", SessionConfig::default()).await;
        let s = mesh.create_gateway(NodeId::new("s")).await;
        let source = NodeId::new("s");
        r.cache.insert(msg("x", 7)).unwrap();

        r.manager.on_control(&source, start(true)).await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(r.manager.active_receptions(), vec![source.clone()]);
        match drain(&s).as_slice() {
            [Inbound::Control(ControlMessage::ReplicationStartReply {
                known: Some(known), ..
            })] => assert!(known.contains_id(&msg("x", 7).id)),
            other => panic!("expected start reply, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_acks_in_batches_of_ten() {
        let mesh = MemoryMesh::new();
        let r = node(&mesh, "r", SessionConfig::default()).await;
        let s = mesh.create_gateway(NodeId::new("s")).await;
        let source = NodeId::new("s");

        r.manager.on_control(&source, start(true)).await;
        sleep(Duration::from_millis(10)).await;
        drain(&s);

        for seq in 1..=9 {
            r.manager.on_cache_updated(&msg("s", seq)).await;
        }
        assert_eq!(r.manager.pending_acks(&source), 9);
        assert!(drain(&s).is_empty());

        r.manager.on_cache_updated(&msg("s", 10)).await;
        assert_eq!(r.manager.pending_acks(&source), 0);
        match drain(&s).as_slice() {
            [Inbound::Control(ControlMessage::BatchAck { message_ids, .. })] => {
                assert_eq!(message_ids.len(), 10)
            }
            other => panic!("expected one batch ack, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replication_end_flushes_partial_batch() {
        let mesh = MemoryMesh::new();
        let r = node(&mesh, "r", SessionConfig::default()).await;
        let s = mesh.create_gateway(NodeId::new("s")).await;
        let source = NodeId::new("s");

        r.manager.on_control(&source, start(true)).await;
        sleep(Duration::from_millis(10)).await;
        drain(&s);

        for seq in 1..=3 {
            r.manager.on_cache_updated(&msg("s", seq)).await;
        }
        r.manager
            .on_control(
                &source,
                ControlMessage::ReplicationEnd {
                    protocol_version: PROTOCOL_VERSION,
                },
            )
            .await;

        assert!(r.manager.active_receptions().is_empty());
        match drain(&s).as_slice() {
            [Inbound::Control(ControlMessage::BatchAck { message_ids, .. })] => {
                assert_eq!(message_ids.len(), 3)
            }
            other => panic!("expected one batch ack, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushed_on_interval() {
        let mesh = MemoryMesh::new();
        let r = node(&mesh, "r", SessionConfig::default()).await;
        let s = mesh.create_gateway(NodeId::new("s")).await;
        let source = NodeId::new("s");

        r.manager.on_control(&source, start(true)).await;
        sleep(Duration::from_millis(10)).await;
        drain(&s);

        r.manager.on_cache_updated(&msg("s", 1)).await;
        r.manager.on_cache_updated(&msg("s", 2)).await;
        sleep(Duration::from_millis(5_500)).await;

        match drain(&s).as_slice() {
            [Inbound::Control(ControlMessage::BatchAck { message_ids, .. })] => {
                assert_eq!(message_ids.len(), 2)
            }
            other => panic!("expected one batch ack, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_mismatch_is_ignored() {
        let mesh = MemoryMesh::new();
        let r = node(&mesh, "r", SessionConfig::default()).await;
        let s = mesh.create_gateway(NodeId::new("s")).await;

        let stale = ControlMessage::ReplicationStart {
            protocol_version: PROTOCOL_VERSION + 1,
            send_current_data_list: true,
            require_acks: true,
            groups: Vec::new(),
        };
        r.manager.on_control(&NodeId::new("s"), stale).await;
        sleep(Duration::from_millis(10)).await;

        assert!(r.manager.active_receptions().is_empty());
        assert!(drain(&s).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_reception_and_source_death() {
        let mesh = MemoryMesh::new();
        let r = node(&mesh, "r", SessionConfig::default()).await;
        let _s1 = mesh.create_gateway(NodeId::new("s1")).await;
        let _s2 = mesh.create_gateway(NodeId::new("s2")).await;
        let (s1, s2) = (NodeId::new("s1"), NodeId::new("s2"));

        r.manager.on_control(&s1, start(true)).await;
        r.manager.on_control(&s2, start(true)).await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(r.manager.active_receptions(), vec![s1.clone()]);
        assert_eq!(r.manager.pending_sources(), vec![s2.clone()]);

        r.manager.on_cache_updated(&msg("s1", 1)).await;
        r.manager.dead_neighbor(&s1);
        sleep(Duration::from_millis(10)).await;
        assert_eq!(r.manager.active_receptions(), vec![s2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_waiting_sessions() {
        let mesh = MemoryMesh::new();
        let a = node(&mesh, "a", everyone()).await;
        let _b = mesh.create_gateway(NodeId::new("b")).await;
        let peer = NodeId::new("b");

        a.manager.new_neighbor(&peer);
        sleep(Duration::from_millis(10)).await;
        let session = a.manager.session(&peer).unwrap();

        a.manager.shutdown().await;
        assert_eq!(session.outcome(), Some(SessionOutcome::Cancelled));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(a.manager.terminating_count(), 0);

        a.manager.new_neighbor(&NodeId::new("c"));
        assert!(a.manager.active_replications().is_empty());
    }
}
