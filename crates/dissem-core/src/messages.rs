//! Control message types.
//!
//! These are the messages the replication control plane exchanges with
//! peers on top of the best-effort data path: retransmission hints,
//! acknowledgments, and the replication session handshake.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::ranges::KnownMessages;
use crate::types::MessageId;

/// Current session protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Message size limits.
pub mod limits {
    /// Max groups in ReplicationStart.groups.
    pub const MAX_GROUPS: usize = 100;
    /// Max message ids in BatchAck.message_ids.
    pub const MAX_ACK_IDS: usize = 100;
    /// Max groups in a ReplicationStartReply catalogue.
    pub const MAX_KNOWN_GROUPS: usize = 1000;
}

/// Control messages of the replication control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Ask the receiver to pull the remainder of a message it already
    /// knows about instead of having it resent in full.
    MessageRequest {
        /// Message the receiver should complete.
        message_id: MessageId,
    },

    /// Ask the sender for the fragments of a message the requester is
    /// still missing.
    DataRequest {
        /// Message to complete.
        message_id: MessageId,
    },

    /// Acknowledge a single message sent with the ack bit set.
    Ack {
        /// Message being acknowledged.
        message_id: MessageId,
    },

    /// Session handshake: the initiator asks to replicate to the receiver.
    ReplicationStart {
        /// Protocol version for compatibility checking.
        protocol_version: u8,
        /// Receiver should reply with the messages it already has.
        send_current_data_list: bool,
        /// Receiver should acknowledge replicated messages in batches.
        require_acks: bool,
        /// Scope of the session. Empty means "all groups".
        groups: Vec<String>,
    },

    /// Session handshake: the receiver accepts.
    ReplicationStartReply {
        /// Protocol version for compatibility checking.
        protocol_version: u8,
        /// Messages the receiver already has, if it was asked for them.
        known: Option<KnownMessages>,
    },

    /// The initiator has nothing more to send.
    ReplicationEnd {
        /// Protocol version for compatibility checking.
        protocol_version: u8,
    },

    /// Batched acknowledgment of replicated messages.
    BatchAck {
        /// Protocol version for compatibility checking.
        protocol_version: u8,
        /// Messages the receiver completed.
        message_ids: Vec<MessageId>,
    },
}

impl ControlMessage {
    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::MessageRequest { .. } => "message-request",
            ControlMessage::DataRequest { .. } => "data-request",
            ControlMessage::Ack { .. } => "ack",
            ControlMessage::ReplicationStart { .. } => "replication-start",
            ControlMessage::ReplicationStartReply { .. } => "replication-start-reply",
            ControlMessage::ReplicationEnd { .. } => "replication-end",
            ControlMessage::BatchAck { .. } => "batch-ack",
        }
    }

    /// Protocol version carried by session messages.
    ///
    /// Retransmission hints and single acks are unversioned.
    pub fn protocol_version(&self) -> Option<u8> {
        match self {
            ControlMessage::MessageRequest { .. }
            | ControlMessage::DataRequest { .. }
            | ControlMessage::Ack { .. } => None,
            ControlMessage::ReplicationStart { protocol_version, .. }
            | ControlMessage::ReplicationStartReply { protocol_version, .. }
            | ControlMessage::ReplicationEnd { protocol_version }
            | ControlMessage::BatchAck { protocol_version, .. } => Some(*protocol_version),
        }
    }

    /// Whether this message belongs to the replication session protocol.
    pub fn is_session_message(&self) -> bool {
        self.protocol_version().is_some()
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            ControlMessage::ReplicationStart { groups, .. } => {
                if groups.len() > limits::MAX_GROUPS {
                    return Err("too many groups");
                }
            }
            ControlMessage::ReplicationStartReply { known: Some(known), .. } => {
                if known.groups().count() > limits::MAX_KNOWN_GROUPS {
                    return Err("too many known groups");
                }
            }
            ControlMessage::BatchAck { message_ids, .. } => {
                if message_ids.len() > limits::MAX_ACK_IDS {
                    return Err("too many ack ids");
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Encode as CBOR. Messages the receiving side would reject for size
    /// are refused here.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate_limits()
            .map_err(|e| CoreError::LimitExceeded(e.to_string()))?;
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR and check size limits.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let msg: Self = ciborium::from_reader(bytes)
            .map_err(|e| CoreError::DecodingError(e.to_string()))?;
        msg.validate_limits()
            .map_err(|e| CoreError::LimitExceeded(e.to_string()))?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[test]
    fn test_start_message_survives_encoding() {
        let msg = ControlMessage::ReplicationStart {
            protocol_version: PROTOCOL_VERSION,
            send_current_data_list: true,
            require_acks: false,
            groups: vec!["tracks".into()],
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(ControlMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_reply_carries_known_messages() {
        let mut known = KnownMessages::new();
        known.insert_id(&MessageId::new("tracks", &NodeId::new("a"), 3));
        let msg = ControlMessage::ReplicationStartReply {
            protocol_version: PROTOCOL_VERSION,
            known: Some(known.clone()),
        };
        let decoded = ControlMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        match decoded {
            ControlMessage::ReplicationStartReply { known: Some(k), .. } => assert_eq!(k, known),
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_ack_limit() {
        let ids = (0..limits::MAX_ACK_IDS + 1)
            .map(|i| MessageId::opaque(format!("m{}", i)))
            .collect();
        let msg = ControlMessage::BatchAck {
            protocol_version: PROTOCOL_VERSION,
            message_ids: ids,
        };
        assert!(msg.validate_limits().is_err());
        assert!(matches!(msg.to_bytes(), Err(CoreError::LimitExceeded(_))));

        let mut bytes = Vec::new();
        ciborium::into_writer(&msg, &mut bytes).unwrap();
        assert!(matches!(
            ControlMessage::from_bytes(&bytes),
            Err(CoreError::LimitExceeded(_))
        ));
    }

    #[test]
    fn test_oversized_start_is_not_encoded() {
        let msg = ControlMessage::ReplicationStart {
            protocol_version: PROTOCOL_VERSION,
            send_current_data_list: true,
            require_acks: true,
            groups: (0..=limits::MAX_GROUPS).map(|i| format!("g{}", i)).collect(),
        };
        assert!(matches!(msg.to_bytes(), Err(CoreError::LimitExceeded(_))));
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(matches!(
            ControlMessage::from_bytes(&[0xff, 0x00, 0x13]),
            Err(CoreError::DecodingError(_))
        ));
    }

    #[test]
    fn test_versioned_kinds() {
        let request = ControlMessage::MessageRequest {
            message_id: MessageId::opaque("m1"),
        };
        assert!(!request.is_session_message());
        assert_eq!(request.kind(), "message-request");

        let end = ControlMessage::ReplicationEnd {
            protocol_version: PROTOCOL_VERSION,
        };
        assert_eq!(end.protocol_version(), Some(PROTOCOL_VERSION));
    }
}
