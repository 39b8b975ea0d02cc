//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use dissem_cache::CachedMessage;
use dissem_core::{MessageId, NodeId, ReplicationConfig, StrategyKind, TargetFilter};
use rand::RngCore;
use tracing_subscriber::filter::LevelFilter;

/// Route tracing output through the test harness. Safe to call from every
/// test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(LevelFilter::DEBUG)
        .try_init();
}

pub fn node_id(name: &str) -> NodeId {
    NodeId::new(name)
}

/// A complete message published by `publisher`.
pub fn message(group: &str, publisher: &str, seq: u64) -> CachedMessage {
    CachedMessage::complete(
        MessageId::new(group, &node_id(publisher), seq),
        group,
        random_payload(64),
    )
}

pub fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut payload);
    payload
}

/// A configuration with timers short enough for simulated clusters.
///
/// Sessions target every neighbour.
pub fn fast_config(kind: StrategyKind) -> ReplicationConfig {
    let mut config = ReplicationConfig::default();
    config.engine.ack_timeout_ms = 500;
    config.engine.idle_poll_ms = 100;
    config.engine.busy_poll_ms = 20;
    config.session.targets = TargetFilter::everyone();
    config.session.ack_cycle_ms = 200;
    config.session.session_ack_timeout_ms = 2_000;
    config.session.data_send_timeout_ms = 500;
    config.session.flow_control_poll_ms = 20;
    config.strategy.kind = kind;
    config
}
