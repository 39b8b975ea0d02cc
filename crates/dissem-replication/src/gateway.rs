//! Gateway abstraction: the outbound side of the dissemination service.
//!
//! The replication control plane never touches the network itself. Data
//! sends, control messages and flow control all go through a [`Gateway`].

use std::time::Duration;

use async_trait::async_trait;
use dissem_core::{ControlMessage, MessageId, NodeId};

use crate::error::Result;

/// Outbound interface the control plane drives.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send a cached message to `target`.
    ///
    /// With `require_ack` set the receiver answers with an
    /// [`ControlMessage::Ack`] once it holds the complete message.
    async fn send_data(
        &self,
        message: &MessageId,
        target: &NodeId,
        timeout: Duration,
        priority: u8,
        require_ack: bool,
    ) -> Result<()>;

    /// Send a control message to `target`.
    async fn send_control(&self, message: ControlMessage, target: &NodeId) -> Result<()>;

    /// The local node's identity.
    fn local_node_id(&self) -> NodeId;

    /// Whether the outbound path can take more data right now.
    async fn clear_to_send(&self) -> bool {
        true
    }
}

/// An in-memory mesh for testing.
///
/// Control messages cross the mesh CBOR-encoded, the way they would on a
/// real link. Every gateway keeps a log of what it tried to send.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, PoisonError};

    use tokio::sync::{mpsc, Mutex, RwLock};

    use crate::error::ReplicationError;

    /// What travels between nodes.
    #[derive(Debug)]
    enum Payload {
        Data {
            message_id: MessageId,
            require_ack: bool,
        },
        Control(Vec<u8>),
    }

    #[derive(Debug)]
    struct Envelope {
        from: NodeId,
        payload: Payload,
    }

    /// A delivery as seen by the receiving node.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Inbound {
        /// A data message arrived.
        Data {
            message_id: MessageId,
            require_ack: bool,
        },
        /// A control message arrived.
        Control(ControlMessage),
    }

    /// What a gateway tried to send.
    #[derive(Debug, Clone, PartialEq)]
    pub enum SentKind {
        Data {
            message_id: MessageId,
            require_ack: bool,
            priority: u8,
            timeout: Duration,
        },
        Control(ControlMessage),
    }

    /// One entry in a gateway's send log.
    #[derive(Debug, Clone, PartialEq)]
    pub struct SentRecord {
        pub target: NodeId,
        pub kind: SentKind,
        /// Whether the mesh accepted the send.
        pub delivered: bool,
    }

    /// Shared routing state for a set of in-memory gateways.
    pub struct MemoryMesh {
        inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
        severed: RwLock<HashSet<(NodeId, NodeId)>>,
    }

    impl MemoryMesh {
        /// Create a new mesh.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a gateway attached to this mesh.
        pub async fn create_gateway(self: &Arc<Self>, node_id: NodeId) -> MemoryGateway {
            let (tx, rx) = mpsc::unbounded_channel();
            self.inboxes.write().await.insert(node_id.clone(), tx);

            MemoryGateway {
                node_id,
                mesh: Arc::clone(self),
                receiver: Mutex::new(rx),
                sent: std::sync::Mutex::new(Vec::new()),
                congested: AtomicBool::new(false),
            }
        }

        /// Drop the link between two nodes in both directions.
        pub async fn sever(&self, a: &NodeId, b: &NodeId) {
            let mut severed = self.severed.write().await;
            severed.insert((a.clone(), b.clone()));
            severed.insert((b.clone(), a.clone()));
        }

        /// Restore a severed link.
        pub async fn heal(&self, a: &NodeId, b: &NodeId) {
            let mut severed = self.severed.write().await;
            severed.remove(&(a.clone(), b.clone()));
            severed.remove(&(b.clone(), a.clone()));
        }

        async fn route(&self, from: &NodeId, to: &NodeId, payload: Payload) -> Result<()> {
            if self.severed.read().await.contains(&(from.clone(), to.clone())) {
                return Err(ReplicationError::TransportError("link severed".into()));
            }
            let inboxes = self.inboxes.read().await;
            let inbox = inboxes
                .get(to)
                .ok_or_else(|| ReplicationError::PeerNotConnected(to.clone()))?;
            inbox
                .send(Envelope {
                    from: from.clone(),
                    payload,
                })
                .map_err(|_| ReplicationError::TransportError("peer disconnected".into()))
        }
    }

    impl Default for MemoryMesh {
        fn default() -> Self {
            Self {
                inboxes: RwLock::new(HashMap::new()),
                severed: RwLock::new(HashSet::new()),
            }
        }
    }

    /// In-memory gateway implementation.
    pub struct MemoryGateway {
        node_id: NodeId,
        mesh: Arc<MemoryMesh>,
        receiver: Mutex<mpsc::UnboundedReceiver<Envelope>>,
        sent: std::sync::Mutex<Vec<SentRecord>>,
        congested: AtomicBool,
    }

    impl MemoryGateway {
        /// Receive the next delivery from any peer.
        pub async fn recv(&self) -> Result<(NodeId, Inbound)> {
            let mut rx = self.receiver.lock().await;
            match rx.recv().await {
                Some(envelope) => open(envelope),
                None => Err(ReplicationError::TransportError("channel closed".into())),
            }
        }

        /// Receive with timeout. `None` if nothing arrived in time.
        pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<(NodeId, Inbound)>> {
            let mut rx = self.receiver.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(envelope)) => open(envelope).map(Some),
                Ok(None) => Err(ReplicationError::TransportError("channel closed".into())),
                Err(_) => Ok(None),
            }
        }

        /// Take a delivery if one is waiting.
        pub fn try_recv(&self) -> Option<Result<(NodeId, Inbound)>> {
            let mut rx = self.receiver.try_lock().ok()?;
            rx.try_recv().ok().map(open)
        }

        /// Everything this gateway has tried to send, oldest first.
        pub fn sent(&self) -> Vec<SentRecord> {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Forget the send log.
        pub fn clear_sent(&self) {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }

        /// Data send attempts of `message` to `target`.
        pub fn data_sends(&self, target: &NodeId, message: &MessageId) -> usize {
            self.sent()
                .iter()
                .filter(|record| &record.target == target)
                .filter(|record| {
                    matches!(&record.kind, SentKind::Data { message_id, .. } if message_id == message)
                })
                .count()
        }

        /// Data send attempts of any message to `target`.
        pub fn data_sends_to(&self, target: &NodeId) -> Vec<MessageId> {
            self.sent()
                .into_iter()
                .filter(|record| &record.target == target)
                .filter_map(|record| match record.kind {
                    SentKind::Data { message_id, .. } => Some(message_id),
                    SentKind::Control(_) => None,
                })
                .collect()
        }

        /// Control messages sent to `target`.
        pub fn controls_to(&self, target: &NodeId) -> Vec<ControlMessage> {
            self.sent()
                .into_iter()
                .filter(|record| &record.target == target)
                .filter_map(|record| match record.kind {
                    SentKind::Control(message) => Some(message),
                    SentKind::Data { .. } => None,
                })
                .collect()
        }

        /// Complete-message requests for `message` sent to `target`.
        pub fn message_requests(&self, target: &NodeId, message: &MessageId) -> usize {
            self.controls_to(target)
                .iter()
                .filter(|control| {
                    matches!(control, ControlMessage::MessageRequest { message_id } if message_id == message)
                })
                .count()
        }

        /// Simulate a saturated outbound path.
        pub fn set_congested(&self, congested: bool) {
            self.congested.store(congested, Ordering::SeqCst);
        }

        fn log(&self, target: &NodeId, kind: SentKind, delivered: bool) {
            self.sent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(SentRecord {
                    target: target.clone(),
                    kind,
                    delivered,
                });
        }
    }

    fn open(envelope: Envelope) -> Result<(NodeId, Inbound)> {
        let inbound = match envelope.payload {
            Payload::Data {
                message_id,
                require_ack,
            } => Inbound::Data {
                message_id,
                require_ack,
            },
            Payload::Control(bytes) => Inbound::Control(ControlMessage::from_bytes(&bytes)?),
        };
        Ok((envelope.from, inbound))
    }

    #[async_trait]
    impl Gateway for MemoryGateway {
        async fn send_data(
            &self,
            message: &MessageId,
            target: &NodeId,
            timeout: Duration,
            priority: u8,
            require_ack: bool,
        ) -> Result<()> {
            let payload = Payload::Data {
                message_id: message.clone(),
                require_ack,
            };
            let result = self.mesh.route(&self.node_id, target, payload).await;
            self.log(
                target,
                SentKind::Data {
                    message_id: message.clone(),
                    require_ack,
                    priority,
                    timeout,
                },
                result.is_ok(),
            );
            result
        }

        async fn send_control(&self, message: ControlMessage, target: &NodeId) -> Result<()> {
            let bytes = message.to_bytes()?;
            let result = self
                .mesh
                .route(&self.node_id, target, Payload::Control(bytes))
                .await;
            self.log(target, SentKind::Control(message), result.is_ok());
            result
        }

        fn local_node_id(&self) -> NodeId {
            self.node_id.clone()
        }

        async fn clear_to_send(&self) -> bool {
            !self.congested.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{Inbound, MemoryMesh};
    use super::*;
    use crate::error::ReplicationError;
    use dissem_core::{limits, PROTOCOL_VERSION};

    #[tokio::test]
    async fn test_control_message_crosses_mesh() {
        let mesh = MemoryMesh::new();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let gw_a = mesh.create_gateway(a.clone()).await;
        let gw_b = mesh.create_gateway(b.clone()).await;

        let msg = ControlMessage::ReplicationEnd {
            protocol_version: PROTOCOL_VERSION,
        };
        gw_a.send_control(msg.clone(), &b).await.unwrap();

        let (from, inbound) = gw_b.recv().await.unwrap();
        assert_eq!(from, a);
        assert_eq!(inbound, Inbound::Control(msg));
        assert_eq!(gw_a.controls_to(&b).len(), 1);
    }

    #[tokio::test]
    async fn test_data_send_to_unknown_peer_fails_and_is_logged() {
        let mesh = MemoryMesh::new();
        let gw = mesh.create_gateway(NodeId::new("a")).await;
        let ghost = NodeId::new("ghost");
        let id = MessageId::opaque("m1");

        let err = gw
            .send_data(&id, &ghost, Duration::from_secs(1), 5, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::PeerNotConnected(_)));

        let log = gw.sent();
        assert_eq!(log.len(), 1);
        assert!(!log[0].delivered);
        assert_eq!(gw.data_sends(&ghost, &id), 1);
    }

    #[tokio::test]
    async fn test_oversized_control_is_refused_before_sending() {
        let mesh = MemoryMesh::new();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let gw_a = mesh.create_gateway(a).await;
        let gw_b = mesh.create_gateway(b.clone()).await;

        let start = ControlMessage::ReplicationStart {
            protocol_version: PROTOCOL_VERSION,
            send_current_data_list: true,
            require_acks: true,
            groups: (0..=limits::MAX_GROUPS).map(|i| format!("g{}", i)).collect(),
        };
        let err = gw_a.send_control(start, &b).await.unwrap_err();
        assert!(matches!(err, ReplicationError::CodecError(_)));
        assert!(gw_a.sent().is_empty());
        assert!(gw_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_severed_link() {
        let mesh = MemoryMesh::new();
        let a = NodeId::new("a");
        let b = NodeId::new("b");
        let gw_a = mesh.create_gateway(a.clone()).await;
        let gw_b = mesh.create_gateway(b.clone()).await;
        let id = MessageId::opaque("m1");

        mesh.sever(&a, &b).await;
        assert!(gw_a
            .send_data(&id, &b, Duration::from_secs(1), 5, true)
            .await
            .is_err());
        assert!(gw_b.try_recv().is_none());

        mesh.heal(&a, &b).await;
        gw_a.send_data(&id, &b, Duration::from_secs(1), 5, true)
            .await
            .unwrap();
        let (_, inbound) = gw_b.try_recv().unwrap().unwrap();
        assert_eq!(
            inbound,
            Inbound::Data {
                message_id: id,
                require_ack: true
            }
        );
    }

    #[tokio::test]
    async fn test_congestion_flag() {
        let mesh = MemoryMesh::new();
        let gw = mesh.create_gateway(NodeId::new("a")).await;
        assert!(gw.clear_to_send().await);
        gw.set_congested(true);
        assert!(!gw.clear_to_send().await);
    }
}
