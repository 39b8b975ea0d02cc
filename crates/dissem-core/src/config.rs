//! Configuration for the replication control plane.
//!
//! Every struct has a `Default` carrying the deployed defaults and can be
//! deserialized from JSON with missing fields falling back to them.
//! Durations are expressed in milliseconds.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::filter::TargetFilter;
use crate::messages::limits;
use crate::types::NodeId;

/// Retransmission engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a sent message may stay unacknowledged before a retry.
    pub ack_timeout_ms: u64,
    /// Maximum unacknowledged messages in flight per peer.
    pub transmission_window: usize,
    /// Sleep when no peer has work.
    pub idle_poll_ms: u64,
    /// Sleep between service cycles.
    pub busy_poll_ms: u64,
    /// Every this many suppressed retries a full resend is forced.
    pub reenable_period: u8,
    /// Priority passed to the gateway for data sends.
    pub priority: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            transmission_window: 5,
            idle_poll_ms: 1_000,
            busy_poll_ms: 200,
            reenable_period: 10,
            priority: 5,
        }
    }
}

impl EngineConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn busy_poll(&self) -> Duration {
        Duration::from_millis(self.busy_poll_ms)
    }

    /// Check that the configuration can drive an engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transmission_window == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transmission_window",
                reason: "must be at least 1",
            });
        }
        if self.reenable_period == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reenable_period",
                reason: "must be at least 1",
            });
        }
        if self.busy_poll_ms == 0 || self.idle_poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll interval",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }
}

/// Target-based replication session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Which peers are replication targets.
    pub targets: TargetFilter,
    /// Ask targets for the messages they already have.
    pub check_target_for_messages: bool,
    /// Ask targets to acknowledge replicated messages.
    pub require_acks: bool,
    /// Replicate to several targets at once.
    pub concurrent_replication: bool,
    /// Receive from several replicators at once.
    pub concurrent_reception: bool,
    /// Pending acks that trigger a batch ack.
    pub ack_batch_size: usize,
    /// Longest time a partial ack batch is held back.
    pub ack_cycle_ms: u64,
    /// How long to wait for a target to accept a session.
    pub session_ack_timeout_ms: u64,
    /// Timeout passed to the gateway for each replicated message.
    pub data_send_timeout_ms: u64,
    /// Priority passed to the gateway for replicated messages.
    pub priority: u8,
    /// Pause between clear-to-send checks while flow controlled.
    pub flow_control_poll_ms: u64,
    /// Groups a session covers. Empty means all groups.
    pub groups: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            targets: TargetFilter::default(),
            check_target_for_messages: true,
            require_acks: true,
            concurrent_replication: false,
            concurrent_reception: false,
            ack_batch_size: 10,
            ack_cycle_ms: 5_000,
            session_ack_timeout_ms: 60_000,
            data_send_timeout_ms: 2_000,
            priority: 5,
            flow_control_poll_ms: 100,
            groups: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn ack_cycle(&self) -> Duration {
        Duration::from_millis(self.ack_cycle_ms)
    }

    pub fn session_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.session_ack_timeout_ms)
    }

    pub fn data_send_timeout(&self) -> Duration {
        Duration::from_millis(self.data_send_timeout_ms)
    }

    pub fn flow_control_poll(&self) -> Duration {
        Duration::from_millis(self.flow_control_poll_ms)
    }

    /// Check that the configuration can drive a session manager.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ack_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ack_batch_size",
                reason: "must be at least 1",
            });
        }
        if self.ack_cycle_ms == 0 || self.flow_control_poll_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll interval",
                reason: "must be non-zero",
            });
        }
        if self.groups.len() > limits::MAX_GROUPS {
            return Err(ConfigError::InvalidValue {
                field: "groups",
                reason: "more groups than a replication start can carry",
            });
        }
        Ok(())
    }
}

/// Which replication strategy a node runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Default,
    Push,
    Pull,
    PushToConvoy,
    BandwidthAware,
    TargetBased,
}

/// Configuration shared by the replication strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Selected variant.
    pub kind: StrategyKind,
    /// Route pushes through the retransmission engine (ack required).
    pub require_acks: bool,
    /// Patterns of convoy members for push-to-convoy.
    pub convoy: Vec<String>,
    /// Minimum link bandwidth for bandwidth-aware pushes (bits/s).
    pub min_bandwidth_bps: u64,
    /// Bandwidth assumed for peers with no configured value.
    pub default_bandwidth_bps: u64,
    /// Known bandwidth per peer id.
    pub bandwidth_by_peer: BTreeMap<String, u64>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::Default,
            require_acks: true,
            convoy: Vec::new(),
            min_bandwidth_bps: 64_000,
            default_bandwidth_bps: 0,
            bandwidth_by_peer: BTreeMap::new(),
        }
    }
}

impl StrategyConfig {
    /// Configured bandwidth to `peer`, falling back to the default.
    pub fn bandwidth_to(&self, peer: &NodeId) -> u64 {
        self.bandwidth_by_peer
            .get(peer.as_str())
            .copied()
            .unwrap_or(self.default_bandwidth_bps)
    }
}

/// Top-level configuration of one node's replication control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub engine: EngineConfig,
    pub session: SessionConfig,
    pub strategy: StrategyConfig,
}

impl ReplicationConfig {
    /// Parse from JSON; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.session.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicationConfig::default();
        assert_eq!(config.engine.ack_timeout(), Duration::from_millis(5000));
        assert_eq!(config.engine.transmission_window, 5);
        assert_eq!(config.engine.reenable_period, 10);
        assert_eq!(config.session.ack_batch_size, 10);
        assert_eq!(config.session.ack_cycle(), Duration::from_millis(5000));
        assert_eq!(config.session.session_ack_timeout(), Duration::from_secs(60));
        assert!(config.session.check_target_for_messages);
        assert!(config.session.require_acks);
        assert!(!config.session.concurrent_replication);
        assert!(!config.session.concurrent_reception);
        assert_eq!(config.strategy.kind, StrategyKind::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = ReplicationConfig::from_json(
            r#"{
                "engine": { "transmission_window": 8 },
                "session": { "targets": { "include": ["uav-*"] }, "concurrent_replication": true },
                "strategy": { "kind": "target_based" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.engine.transmission_window, 8);
        assert_eq!(config.engine.ack_timeout_ms, 5000);
        assert!(config.session.concurrent_replication);
        assert!(config.session.targets.selects(&NodeId::new("uav-2")));
        assert_eq!(config.strategy.kind, StrategyKind::TargetBased);
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = ReplicationConfig::from_json(r#"{ "engine": { "transmission_window": 0 } }"#)
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "transmission_window",
                ..
            }
        ));
    }

    #[test]
    fn test_too_many_session_groups_rejected() {
        let mut config = ReplicationConfig::default();
        config.session.groups = (0..limits::MAX_GROUPS).map(|i| format!("g{}", i)).collect();
        assert!(config.validate().is_ok());

        config.session.groups.push("one-too-many".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "groups", .. })
        ));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ReplicationConfig::from_json("{ not json"),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn test_bandwidth_lookup() {
        let mut config = StrategyConfig::default();
        config.default_bandwidth_bps = 1_000;
        config.bandwidth_by_peer.insert("sat-1".into(), 9_600);
        assert_eq!(config.bandwidth_to(&NodeId::new("sat-1")), 9_600);
        assert_eq!(config.bandwidth_to(&NodeId::new("other")), 1_000);
    }
}
