//! Proptest generators for property-based testing.

use proptest::prelude::*;

use dissem_core::{
    limits, ControlMessage, KnownMessages, MessageId, MessageKey, NodeId, PROTOCOL_VERSION,
};

/// Generate a node id.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    "[a-z]{1,6}-[0-9]{1,3}".prop_map(NodeId::new)
}

/// Generate a group name. Never contains the id separator.
pub fn group() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9/_-]{0,15}".prop_map(String::from)
}

/// Generate a sequence number.
pub fn seq() -> impl Strategy<Value = u64> {
    0u64..10_000
}

/// Generate a structured message key.
pub fn message_key() -> impl Strategy<Value = MessageKey> {
    (group(), node_id(), seq()).prop_map(|(group, publisher, seq)| MessageKey {
        group,
        publisher,
        seq,
    })
}

/// Generate a structured message id.
pub fn message_id() -> impl Strategy<Value = MessageId> {
    message_key().prop_map(|key| key.to_id())
}

/// Generate up to `max` keys drawn from a small pool of groups and
/// publishers, so sequence ranges actually merge.
pub fn message_keys(max: usize) -> impl Strategy<Value = Vec<MessageKey>> {
    let key = (0usize..3, 0usize..3, 0u64..200).prop_map(|(g, p, seq)| MessageKey {
        group: format!("group-{}", g),
        publisher: NodeId::new(format!("node-{}", p)),
        seq,
    });
    prop::collection::vec(key, 0..=max)
}

/// A catalogue holding exactly `keys`.
pub fn known_from(keys: &[MessageKey]) -> KnownMessages {
    let mut known = KnownMessages::new();
    for key in keys {
        known.insert(key);
    }
    known
}

/// Generate a catalogue of known messages.
pub fn known_messages() -> impl Strategy<Value = KnownMessages> {
    message_keys(100).prop_map(|keys| known_from(&keys))
}

/// Generate a control message within the wire limits.
pub fn control_message() -> impl Strategy<Value = ControlMessage> {
    prop_oneof![
        message_id().prop_map(|message_id| ControlMessage::MessageRequest { message_id }),
        message_id().prop_map(|message_id| ControlMessage::DataRequest { message_id }),
        message_id().prop_map(|message_id| ControlMessage::Ack { message_id }),
        (
            any::<bool>(),
            any::<bool>(),
            prop::collection::vec(group(), 0..=limits::MAX_GROUPS)
        )
            .prop_map(|(send_current_data_list, require_acks, groups)| {
                ControlMessage::ReplicationStart {
                    protocol_version: PROTOCOL_VERSION,
                    send_current_data_list,
                    require_acks,
                    groups,
                }
            }),
        prop::option::of(known_messages()).prop_map(|known| {
            ControlMessage::ReplicationStartReply {
                protocol_version: PROTOCOL_VERSION,
                known,
            }
        }),
        Just(ControlMessage::ReplicationEnd {
            protocol_version: PROTOCOL_VERSION,
        }),
        prop::collection::vec(message_id(), 0..=limits::MAX_ACK_IDS).prop_map(|message_ids| {
            ControlMessage::BatchAck {
                protocol_version: PROTOCOL_VERSION,
                message_ids,
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    proptest! {
        #[test]
        fn message_ids_parse_back(key in message_key()) {
            prop_assert_eq!(key.to_id().key(), Some(key));
        }

        #[test]
        fn known_messages_hold_exactly_what_was_inserted(keys in message_keys(200)) {
            let known = known_from(&keys);
            let distinct: HashSet<&MessageKey> = keys.iter().collect();
            prop_assert_eq!(known.count(), distinct.len() as u64);
            for key in &keys {
                prop_assert!(known.contains(key));
            }
            let mut absent = MessageKey {
                group: "group-0".into(),
                publisher: NodeId::new("node-0"),
                seq: 500,
            };
            prop_assert!(!known.contains(&absent));
            absent.group = "elsewhere".into();
            prop_assert!(!known.contains(&absent));
        }

        #[test]
        fn control_messages_survive_the_wire(message in control_message()) {
            let bytes = message.to_bytes().unwrap();
            prop_assert_eq!(ControlMessage::from_bytes(&bytes).unwrap(), message);
        }
    }
}
