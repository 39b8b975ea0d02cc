//! Replication strategies.
//!
//! A node runs exactly one strategy, picked from configuration. Each one
//! reacts to the same events (cache updates, neighbours coming and going,
//! peers asking for messages, session control traffic) in its own way.

use std::sync::Arc;

use dissem_cache::{CachedMessage, DataCache};
use dissem_core::{
    ControlMessage, EngineConfig, MessageId, NodeId, ReplicationConfig, StrategyConfig,
    StrategyKind, TargetFilter,
};
use tracing::{debug, warn};

use crate::engine::RetransmissionEngine;
use crate::gateway::Gateway;
use crate::liveness::PeerLiveness;
use crate::session::SessionManager;

/// Which live neighbours a push reaches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushScope {
    /// Every live neighbour.
    All,
    /// Live neighbours matching the convoy patterns.
    Convoy(TargetFilter),
    /// Live neighbours with enough configured bandwidth.
    Bandwidth(StrategyConfig),
}

impl PushScope {
    pub fn admits(&self, peer: &NodeId) -> bool {
        match self {
            PushScope::All => true,
            PushScope::Convoy(filter) => filter.matches_any(peer),
            PushScope::Bandwidth(config) => config.bandwidth_to(peer) >= config.min_bandwidth_bps,
        }
    }
}

/// Hands every complete cache update to the live neighbours in scope.
pub struct PushReplicator<G: Gateway + 'static> {
    local: NodeId,
    engine: RetransmissionEngine<G>,
    gateway: Arc<G>,
    liveness: Arc<PeerLiveness>,
    engine_config: EngineConfig,
    require_acks: bool,
    scope: PushScope,
}

impl<G: Gateway + 'static> PushReplicator<G> {
    pub fn new(
        engine: RetransmissionEngine<G>,
        gateway: Arc<G>,
        liveness: Arc<PeerLiveness>,
        engine_config: EngineConfig,
        require_acks: bool,
        scope: PushScope,
    ) -> Self {
        Self {
            local: gateway.local_node_id(),
            engine,
            gateway,
            liveness,
            engine_config,
            require_acks,
            scope,
        }
    }

    pub fn scope(&self) -> &PushScope {
        &self.scope
    }

    /// Push `message` out. Returns how many peers it was handed to.
    pub async fn push(&self, message: &CachedMessage) -> usize {
        if !message.complete {
            return 0;
        }
        let publisher = message.id.key().map(|key| key.publisher);

        let mut pushed = 0;
        for peer in self.liveness.live_peers() {
            if peer == self.local || Some(&peer) == publisher.as_ref() || !self.scope.admits(&peer)
            {
                continue;
            }
            if self.require_acks {
                self.engine.request_ack(&peer, Some(message.id.clone()));
            } else if let Err(e) = self
                .gateway
                .send_data(
                    &message.id,
                    &peer,
                    self.engine_config.ack_timeout(),
                    self.engine_config.priority,
                    false,
                )
                .await
            {
                warn!(peer = %peer, message = %message.id, error = %e, "push failed");
                continue;
            }
            pushed += 1;
        }
        debug!(message = %message.id, peers = pushed, "pushed");
        pushed
    }
}

/// Sends a message only when a peer asks for it.
pub struct PullReplicator<G: Gateway + 'static, C: DataCache + 'static> {
    engine: RetransmissionEngine<G>,
    cache: Arc<C>,
}

impl<G: Gateway + 'static, C: DataCache + 'static> PullReplicator<G, C> {
    pub fn new(engine: RetransmissionEngine<G>, cache: Arc<C>) -> Self {
        Self { engine, cache }
    }

    /// Queue `message` for `peer` if it is held and not already on its way.
    pub async fn serve(&self, message: &MessageId, peer: &NodeId) -> bool {
        if self.engine.is_outstanding(peer, message) {
            debug!(peer = %peer, message = %message, "already on its way");
            return false;
        }
        match self.cache.has_complete(message).await {
            Ok(true) => {
                self.engine.request_ack(peer, Some(message.clone()));
                true
            }
            Ok(false) => {
                debug!(peer = %peer, message = %message, "requested message not held");
                false
            }
            Err(e) => {
                warn!(peer = %peer, message = %message, error = %e, "cache lookup failed");
                false
            }
        }
    }
}

/// The replication strategy of a node.
pub enum ReplicationStrategy<G: Gateway + 'static, C: DataCache + 'static> {
    /// No proactive replication.
    Default,
    Push(PushReplicator<G>),
    Pull(PullReplicator<G, C>),
    PushToConvoy(PushReplicator<G>),
    BandwidthAware(PushReplicator<G>),
    TargetBased(SessionManager<G, C>),
}

impl<G: Gateway + 'static, C: DataCache + 'static> ReplicationStrategy<G, C> {
    /// Build the strategy `config` selects.
    pub fn from_config(
        config: &ReplicationConfig,
        gateway: Arc<G>,
        cache: Arc<C>,
        engine: RetransmissionEngine<G>,
        liveness: Arc<PeerLiveness>,
    ) -> Self {
        let strategy = &config.strategy;
        let push = |scope| {
            PushReplicator::new(
                engine.clone(),
                Arc::clone(&gateway),
                Arc::clone(&liveness),
                config.engine.clone(),
                strategy.require_acks,
                scope,
            )
        };

        match strategy.kind {
            StrategyKind::Default => ReplicationStrategy::Default,
            StrategyKind::Push => ReplicationStrategy::Push(push(PushScope::All)),
            StrategyKind::Pull => {
                ReplicationStrategy::Pull(PullReplicator::new(engine.clone(), Arc::clone(&cache)))
            }
            StrategyKind::PushToConvoy => {
                let convoy = TargetFilter {
                    include: strategy.convoy.clone(),
                    exclude: Vec::new(),
                };
                ReplicationStrategy::PushToConvoy(push(PushScope::Convoy(convoy)))
            }
            StrategyKind::BandwidthAware => {
                ReplicationStrategy::BandwidthAware(push(PushScope::Bandwidth(strategy.clone())))
            }
            StrategyKind::TargetBased => ReplicationStrategy::TargetBased(SessionManager::new(
                Arc::clone(&gateway),
                Arc::clone(&cache),
                config.session.clone(),
            )),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            ReplicationStrategy::Default => StrategyKind::Default,
            ReplicationStrategy::Push(_) => StrategyKind::Push,
            ReplicationStrategy::Pull(_) => StrategyKind::Pull,
            ReplicationStrategy::PushToConvoy(_) => StrategyKind::PushToConvoy,
            ReplicationStrategy::BandwidthAware(_) => StrategyKind::BandwidthAware,
            ReplicationStrategy::TargetBased(_) => StrategyKind::TargetBased,
        }
    }

    /// The session manager, for target-based replication.
    pub fn sessions(&self) -> Option<&SessionManager<G, C>> {
        match self {
            ReplicationStrategy::TargetBased(manager) => Some(manager),
            _ => None,
        }
    }

    pub async fn on_cache_updated(&self, message: &CachedMessage) {
        match self {
            ReplicationStrategy::Push(push)
            | ReplicationStrategy::PushToConvoy(push)
            | ReplicationStrategy::BandwidthAware(push) => {
                push.push(message).await;
            }
            ReplicationStrategy::TargetBased(manager) => manager.on_cache_updated(message).await,
            ReplicationStrategy::Default | ReplicationStrategy::Pull(_) => {}
        }
    }

    pub fn new_neighbor(&self, peer: &NodeId) {
        if let ReplicationStrategy::TargetBased(manager) = self {
            manager.new_neighbor(peer);
        }
    }

    pub fn dead_neighbor(&self, peer: &NodeId) {
        if let ReplicationStrategy::TargetBased(manager) = self {
            manager.dead_neighbor(peer);
        }
    }

    /// A peer asked for the rest of `message`.
    pub async fn on_message_requested(&self, message: &MessageId, peer: &NodeId) {
        if let ReplicationStrategy::Pull(pull) = self {
            pull.serve(message, peer).await;
        }
    }

    pub async fn on_control(&self, sender: &NodeId, message: ControlMessage) {
        match self {
            ReplicationStrategy::TargetBased(manager) => manager.on_control(sender, message).await,
            _ => debug!(
                peer = %sender,
                kind = message.kind(),
                strategy = ?self.kind(),
                "session traffic ignored"
            ),
        }
    }

    /// Explicitly open a session to `peer`. Only target-based replication
    /// has sessions.
    pub fn replicate_to(&self, peer: &NodeId) -> bool {
        match self {
            ReplicationStrategy::TargetBased(manager) => manager.replicate_to(peer),
            _ => {
                debug!(peer = %peer, strategy = ?self.kind(), "no sessions in this strategy");
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        if let ReplicationStrategy::TargetBased(manager) = self {
            manager.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::{MemoryGateway, MemoryMesh};
    use dissem_cache::MemoryCache;
    use std::time::Duration;
    use tokio::time::sleep;

    struct Fixture {
        strategy: ReplicationStrategy<MemoryGateway, MemoryCache>,
        engine: RetransmissionEngine<MemoryGateway>,
        gateway: Arc<MemoryGateway>,
        cache: Arc<MemoryCache>,
        _peers: Vec<MemoryGateway>,
    }

    async fn fixture(strategy: StrategyConfig, live: &[&str]) -> Fixture {
        let mesh = MemoryMesh::new();
        let gateway = Arc::new(mesh.create_gateway(NodeId::new("local")).await);
        let cache = Arc::new(MemoryCache::new());
        let liveness = Arc::new(PeerLiveness::new());
        let mut peers = Vec::new();
        for name in live {
            peers.push(mesh.create_gateway(NodeId::new(*name)).await);
            liveness.mark_new(&NodeId::new(*name));
        }
        let config = ReplicationConfig {
            strategy,
            ..ReplicationConfig::default()
        };
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
            liveness,
        );
        Fixture {
            strategy,
            engine,
            gateway,
            cache,
            _peers: peers,
        }
    }

    fn kind(kind: StrategyKind) -> StrategyConfig {
        StrategyConfig {
            kind,
            ..StrategyConfig::default()
        }
    }

    fn msg(publisher: &str, seq: u64) -> CachedMessage {
        CachedMessage::complete(
            MessageId::new("tracks", &NodeId::new(publisher), seq),
            "tracks",
            vec![1, 2, 3],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_reaches_live_peers_except_publisher() {
        let f = fixture(kind(StrategyKind::Push), &["a", "b", "c"]).await;
        assert_eq!(f.strategy.kind(), StrategyKind::Push);

        f.strategy.on_cache_updated(&msg("b", 1)).await;
        sleep(Duration::from_millis(10)).await;

        let id = msg("b", 1).id;
        assert_eq!(f.gateway.data_sends(&NodeId::new("a"), &id), 1);
        assert_eq!(f.gateway.data_sends(&NodeId::new("b"), &id), 0);
        assert_eq!(f.gateway.data_sends(&NodeId::new("c"), &id), 1);
        assert!(f.engine.is_outstanding(&NodeId::new("a"), &id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_without_acks_bypasses_engine() {
        let config = StrategyConfig {
            require_acks: false,
            ..kind(StrategyKind::Push)
        };
        let f = fixture(config, &["a"]).await;
        f.strategy.on_cache_updated(&msg("x", 1)).await;

        assert_eq!(f.gateway.data_sends(&NodeId::new("a"), &msg("x", 1).id), 1);
        assert!(!f.engine.is_tracking(&NodeId::new("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_messages_are_not_pushed() {
        let f = fixture(kind(StrategyKind::Push), &["a"]).await;
        let partial = CachedMessage::partial(msg("x", 1).id, "tracks", vec![1]);
        f.strategy.on_cache_updated(&partial).await;
        sleep(Duration::from_millis(10)).await;
        assert!(f.gateway.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_to_convoy() {
        let config = StrategyConfig {
            convoy: vec!["convoy-*".into()],
            ..kind(StrategyKind::PushToConvoy)
        };
        let f = fixture(config, &["convoy-1", "convoy-2", "hq"]).await;
        f.strategy.on_cache_updated(&msg("x", 1)).await;
        sleep(Duration::from_millis(10)).await;

        let id = msg("x", 1).id;
        assert_eq!(f.gateway.data_sends(&NodeId::new("convoy-1"), &id), 1);
        assert_eq!(f.gateway.data_sends(&NodeId::new("convoy-2"), &id), 1);
        assert_eq!(f.gateway.data_sends(&NodeId::new("hq"), &id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_aware() {
        let mut config = kind(StrategyKind::BandwidthAware);
        config.min_bandwidth_bps = 64_000;
        config.bandwidth_by_peer.insert("fiber".into(), 1_000_000);
        config.bandwidth_by_peer.insert("hf".into(), 2_400);
        let f = fixture(config, &["fiber", "hf", "unknown"]).await;

        f.strategy.on_cache_updated(&msg("x", 1)).await;
        sleep(Duration::from_millis(10)).await;

        let id = msg("x", 1).id;
        assert_eq!(f.gateway.data_sends(&NodeId::new("fiber"), &id), 1);
        assert_eq!(f.gateway.data_sends(&NodeId::new("hf"), &id), 0);
        assert_eq!(f.gateway.data_sends(&NodeId::new("unknown"), &id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_serves_held_messages_once() {
        let f = fixture(kind(StrategyKind::Pull), &["a"]).await;
        let peer = NodeId::new("a");
        let held = msg("x", 1);
        f.cache.insert(held.clone()).unwrap();

        f.strategy.on_cache_updated(&held).await;
        sleep(Duration::from_millis(10)).await;
        assert!(f.gateway.sent().is_empty());

        f.strategy.on_message_requested(&held.id, &peer).await;
        f.strategy.on_message_requested(&held.id, &peer).await;
        f.strategy.on_message_requested(&msg("x", 2).id, &peer).await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(f.gateway.data_sends_to(&peer), vec![held.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_does_nothing() {
        let f = fixture(kind(StrategyKind::Default), &["a"]).await;
        f.strategy.on_cache_updated(&msg("x", 1)).await;
        f.strategy.new_neighbor(&NodeId::new("a"));
        assert!(!f.strategy.replicate_to(&NodeId::new("a")));
        sleep(Duration::from_millis(10)).await;
        assert!(f.gateway.sent().is_empty());
        assert!(f.strategy.sessions().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_based_delegates_to_sessions() {
        let f = fixture(kind(StrategyKind::TargetBased), &["a"]).await;
        let sessions = f.strategy.sessions().unwrap();
        assert!(f.strategy.replicate_to(&NodeId::new("a")));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(sessions.active_replications(), vec![NodeId::new("a")]);

        f.strategy.dead_neighbor(&NodeId::new("a"));
        assert!(sessions.active_replications().is_empty());
        f.strategy.shutdown().await;
    }
}
