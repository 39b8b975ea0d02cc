//! The replication service: one node's control plane behind a single API.
//!
//! The service owns the retransmission engine and the configured strategy
//! and routes the dissemination service's upward events to them.

use std::sync::Arc;

use dissem_cache::{CachedMessage, DataCache};
use dissem_core::{ControlMessage, MessageId, NodeId, ReplicationConfig, StrategyKind};
use dissem_replication::{
    Gateway, PeerLiveness, ReplicationStrategy, RetransmissionEngine, SessionManager,
};
use tracing::{debug, info, warn};

use crate::error::Result;

/// One node's replication control plane.
///
/// Provides a unified API for:
/// - Reliable per-peer delivery (ack requests, acks, pull requests)
/// - Neighbour up/down events
/// - Cache update notifications driving the configured strategy
/// - Inbound control traffic, decoded or raw
pub struct ReplicationService<G: Gateway + 'static, C: DataCache + 'static> {
    /// This node.
    local: NodeId,
    /// Validated configuration.
    config: ReplicationConfig,
    /// Outbound path.
    gateway: Arc<G>,
    /// Local data cache.
    cache: Arc<C>,
    /// Neighbour up/down bookkeeping shared with the engine and pushes.
    liveness: Arc<PeerLiveness>,
    /// Reliable delivery.
    engine: RetransmissionEngine<G>,
    /// What goes where.
    strategy: ReplicationStrategy<G, C>,
}

impl<G: Gateway + 'static, C: DataCache + 'static> ReplicationService<G, C> {
    /// Create a service. Rejects configurations that cannot drive the
    /// engine or the session manager.
    pub fn new(gateway: Arc<G>, cache: Arc<C>, config: ReplicationConfig) -> Result<Self> {
        config.validate()?;

        let local = gateway.local_node_id();
        let liveness = Arc::new(PeerLiveness::new());
        let engine = RetransmissionEngine::new(
            Arc::clone(&gateway),
            Arc::clone(&liveness),
            config.engine.clone(),
        );
        let strategy = ReplicationStrategy::from_config(
            &config,
            Arc::clone(&gateway),
            Arc::clone(&cache),
            engine.clone(),
            Arc::clone(&liveness),
        );
        info!(node = %local, strategy = ?strategy.kind(), "replication service created");

        Ok(Self {
            local,
            config,
            gateway,
            cache,
            liveness,
            engine,
            strategy,
        })
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn engine(&self) -> &RetransmissionEngine<G> {
        &self.engine
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// The session manager, when running target-based replication.
    pub fn sessions(&self) -> Option<&SessionManager<G, C>> {
        self.strategy.sessions()
    }

    /// Whether `peer` is currently considered reachable.
    pub fn is_alive(&self, peer: &NodeId) -> bool {
        self.liveness.is_alive(peer)
    }

    /// Every peer currently considered reachable, sorted.
    pub fn live_peers(&self) -> Vec<NodeId> {
        self.liveness.live_peers()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reliable Delivery
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask for reliable delivery of `message` to `peer`. With `None` the
    /// peer is only scheduled for service.
    pub fn request_ack(&self, peer: &NodeId, message: Option<MessageId>) {
        self.engine.request_ack(peer, message);
    }

    /// `peer` acknowledged `message`.
    pub fn on_acknowledged(&self, message: &MessageId, peer: &NodeId) {
        self.engine.on_acknowledged(message, peer);
    }

    /// `peer` asked for the rest of `message`.
    ///
    /// Full resends to it are suppressed in favour of completion requests,
    /// and a pull strategy serves the message.
    pub async fn on_requested(&self, message: &MessageId, peer: &NodeId) {
        self.engine.on_requested(message, peer);
        self.strategy.on_message_requested(message, peer).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Neighbours
    // ─────────────────────────────────────────────────────────────────────────

    pub fn new_neighbor(&self, peer: &NodeId) {
        if peer == &self.local {
            return;
        }
        info!(node = %self.local, peer = %peer, "neighbour up");
        self.engine.new_neighbor(peer);
        self.strategy.new_neighbor(peer);
    }

    pub fn dead_neighbor(&self, peer: &NodeId) {
        if peer == &self.local {
            return;
        }
        info!(node = %self.local, peer = %peer, "neighbour down");
        self.engine.dead_neighbor(peer);
        self.strategy.dead_neighbor(peer);
    }

    /// Explicitly replicate to `peer`. Only target-based replication opens
    /// sessions; every other strategy returns `false`.
    pub fn replicate_to(&self, peer: &NodeId) -> bool {
        self.strategy.replicate_to(peer)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound Events
    // ─────────────────────────────────────────────────────────────────────────

    /// The local cache gained or completed `message`.
    pub async fn on_cache_updated(&self, message: &CachedMessage) {
        self.strategy.on_cache_updated(message).await;
    }

    /// Data for `message` arrived from `sender`.
    ///
    /// Acks the sender when the data asked for it and the cache now holds
    /// the complete message. Partial data is acked once the remaining
    /// fragments arrive.
    pub async fn on_data_received(
        &self,
        sender: &NodeId,
        message: &MessageId,
        require_ack: bool,
    ) -> Result<()> {
        if !require_ack {
            return Ok(());
        }
        if self.cache.has_complete(message).await? {
            self.gateway
                .send_control(
                    ControlMessage::Ack {
                        message_id: message.clone(),
                    },
                    sender,
                )
                .await?;
            debug!(peer = %sender, message = %message, "acked delivery");
        }
        Ok(())
    }

    /// Route a control message from `sender`.
    pub async fn on_control_message(&self, sender: &NodeId, message: ControlMessage) {
        match message {
            ControlMessage::Ack { message_id } => self.on_acknowledged(&message_id, sender),
            ControlMessage::DataRequest { message_id } => {
                self.on_requested(&message_id, sender).await
            }
            ControlMessage::MessageRequest { message_id } => {
                self.answer_completion_request(&message_id, sender).await
            }
            session => self.strategy.on_control(sender, session).await,
        }
    }

    /// Decode a CBOR control message from `sender` and route it.
    pub async fn on_control_bytes(&self, sender: &NodeId, bytes: &[u8]) -> Result<()> {
        let message = ControlMessage::from_bytes(bytes)?;
        self.on_control_message(sender, message).await;
        Ok(())
    }

    /// A sender asked whether we hold `message` complete. Yes gets an
    /// `Ack`, no gets a request to send the rest.
    async fn answer_completion_request(&self, message: &MessageId, sender: &NodeId) {
        let reply = match self.cache.has_complete(message).await {
            Ok(true) => ControlMessage::Ack {
                message_id: message.clone(),
            },
            Ok(false) => ControlMessage::DataRequest {
                message_id: message.clone(),
            },
            Err(e) => {
                warn!(peer = %sender, message = %message, error = %e, "cache lookup failed");
                return;
            }
        };
        let kind = reply.kind();
        if let Err(e) = self.gateway.send_control(reply, sender).await {
            warn!(peer = %sender, message = %message, error = %e, "completion reply not sent");
        } else {
            debug!(peer = %sender, message = %message, reply = kind, "answered completion request");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop the engine's dispatch task and cancel every session.
    pub async fn shutdown(&self) {
        info!(node = %self.local, "replication service shutting down");
        self.strategy.shutdown().await;
        self.engine.shutdown().await;
    }
}
