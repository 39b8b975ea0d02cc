//! Simulated clusters: replication services wired to one in-memory mesh.
//!
//! The mesh only carries message ids. Payloads published through the
//! cluster are kept in a shared library so a receiving node can put the
//! full message into its own cache when the data arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dissem::ReplicationService;
use dissem_cache::{CachedMessage, DataCache, MemoryCache};
use dissem_core::{MessageId, NodeId, ReplicationConfig};
use dissem_replication::{Inbound, MemoryGateway, MemoryMesh};
use tokio::time::{sleep, Instant};

use crate::fixtures::message;

/// Delivery pump period for [`TestCluster::run_for`].
const TICK: Duration = Duration::from_millis(10);

/// Passes of one [`TestCluster::deliver`] call before it gives up on
/// reaching quiescence.
const MAX_PASSES: usize = 64;

/// One node of a simulated cluster.
pub struct TestNode {
    pub id: NodeId,
    pub gateway: Arc<MemoryGateway>,
    pub cache: Arc<MemoryCache>,
    pub service: ReplicationService<MemoryGateway, MemoryCache>,
}

/// Several nodes on one mesh.
pub struct TestCluster {
    mesh: Arc<MemoryMesh>,
    nodes: Vec<TestNode>,
    library: Mutex<HashMap<MessageId, CachedMessage>>,
}

impl TestCluster {
    /// Nodes named `names`, all with the same configuration.
    pub async fn new(names: &[&str], config: ReplicationConfig) -> Self {
        let nodes = names.iter().map(|name| (*name, config.clone())).collect();
        Self::with_configs(nodes).await
    }

    /// Nodes with individual configurations.
    pub async fn with_configs(nodes: Vec<(&str, ReplicationConfig)>) -> Self {
        let mesh = MemoryMesh::new();
        let mut built = Vec::with_capacity(nodes.len());
        for (name, config) in nodes {
            let id = NodeId::new(name);
            let gateway = Arc::new(mesh.create_gateway(id.clone()).await);
            let cache = Arc::new(MemoryCache::new());
            let service = ReplicationService::new(Arc::clone(&gateway), Arc::clone(&cache), config)
                .expect("test configuration must be valid");
            built.push(TestNode {
                id,
                gateway,
                cache,
                service,
            });
        }
        Self {
            mesh,
            nodes: built,
            library: Mutex::new(HashMap::new()),
        }
    }

    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    /// The node named `name`. Panics if there is none.
    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.id.as_str() == name)
            .unwrap_or_else(|| panic!("no node named {}", name))
    }

    /// Tell `a` and `b` about each other.
    pub fn connect(&self, a: &str, b: &str) {
        self.node(a).service.new_neighbor(&NodeId::new(b));
        self.node(b).service.new_neighbor(&NodeId::new(a));
    }

    /// Tell every node about every other node.
    pub fn connect_all(&self) {
        for node in &self.nodes {
            for peer in &self.nodes {
                if peer.id != node.id {
                    node.service.new_neighbor(&peer.id);
                }
            }
        }
    }

    /// Tell `a` and `b` they lost each other.
    pub fn disconnect(&self, a: &str, b: &str) {
        self.node(a).service.dead_neighbor(&NodeId::new(b));
        self.node(b).service.dead_neighbor(&NodeId::new(a));
    }

    /// Cut the link between `a` and `b` without either noticing.
    pub async fn sever(&self, a: &str, b: &str) {
        self.mesh.sever(&NodeId::new(a), &NodeId::new(b)).await;
    }

    pub async fn heal(&self, a: &str, b: &str) {
        self.mesh.heal(&NodeId::new(a), &NodeId::new(b)).await;
    }

    /// Publish a complete message at `publisher` and announce it.
    pub async fn publish(&self, publisher: &str, group: &str, seq: u64) -> CachedMessage {
        let published = message(group, publisher, seq);
        self.store(publisher, published.clone()).await;
        published
    }

    /// Put `message` into `name`'s cache and announce it, as if it had been
    /// assembled there.
    pub async fn store(&self, name: &str, message: CachedMessage) {
        self.library
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message.id.clone(), message.clone());
        let node = self.node(name);
        let added = node.cache.insert(message.clone()).expect("memory cache insert");
        if added {
            node.service.on_cache_updated(&message).await;
        }
    }

    /// Whether `name` holds `message` complete.
    pub fn holds(&self, name: &str, message: &MessageId) -> bool {
        self.node(name)
            .cache
            .get(message)
            .ok()
            .flatten()
            .map_or(false, |held| held.complete)
    }

    /// Whether `source`'s history records `message` as delivered to `target`.
    pub async fn replicated(&self, source: &str, message: &MessageId, target: &str) -> bool {
        self.node(source)
            .cache
            .was_replicated(message, &NodeId::new(target))
            .await
            .unwrap_or(false)
    }

    /// Deliver everything queued on the mesh, including whatever the
    /// deliveries themselves cause to be sent. Returns how many inbound
    /// messages were handled.
    pub async fn deliver(&self) -> usize {
        let mut handled = 0;
        for _ in 0..MAX_PASSES {
            let mut pass = 0;
            for node in &self.nodes {
                while let Some(Ok((from, inbound))) = node.gateway.try_recv() {
                    self.dispatch(node, &from, inbound).await;
                    pass += 1;
                }
            }
            if pass == 0 {
                break;
            }
            handled += pass;
        }
        handled
    }

    /// Pump deliveries for `duration` of (possibly paused) tokio time.
    pub async fn run_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.deliver().await;
            sleep(TICK).await;
        }
        self.deliver().await;
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.service.shutdown().await;
        }
    }

    async fn dispatch(&self, node: &TestNode, from: &NodeId, inbound: Inbound) {
        match inbound {
            Inbound::Data {
                message_id,
                require_ack,
            } => {
                let published = self
                    .library
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&message_id)
                    .cloned();
                let Some(published) = published else {
                    return;
                };
                let added = node.cache.insert(published.clone()).expect("memory cache insert");
                if added {
                    node.service.on_cache_updated(&published).await;
                }
                let _ = node
                    .service
                    .on_data_received(from, &message_id, require_ack)
                    .await;
            }
            Inbound::Control(control) => node.service.on_control_message(from, control).await,
        }
    }
}
