//! Gateway configuration

use std::collections::BTreeMap;

use semblance_guard::{AnomalyConfig, RateLimitConfig};
use semblance_types::ActionType;
use serde::{Deserialize, Serialize};

use crate::catalog::ActionOverride;

/// Pipeline configuration. Every field has a default, so an empty document
/// is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum clock skew accepted in either direction, also the replay TTL.
    #[serde(default = "default_freshness_ttl")]
    pub freshness_ttl_ms: u64,

    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,

    /// Zero disables the background sweep.
    #[serde(default = "default_sweep_interval")]
    pub replay_sweep_interval_ms: u64,

    /// Re-seed the replay set from recent audit entries on startup.
    #[serde(default = "default_true")]
    pub rebuild_replay_from_audit: bool,

    /// Hostnames the gateway may contact.
    #[serde(default)]
    pub allowlist: Vec<String>,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    /// Per-action overrides of the built-in catalog.
    #[serde(default)]
    pub actions: BTreeMap<ActionType, ActionOverride>,

    /// Connections and unauthorized attempts kept for the network monitor.
    #[serde(default = "default_network_history")]
    pub network_history_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            freshness_ttl_ms: default_freshness_ttl(),
            replay_capacity: default_replay_capacity(),
            replay_sweep_interval_ms: default_sweep_interval(),
            rebuild_replay_from_audit: true,
            allowlist: Vec::new(),
            rate_limits: RateLimitConfig::default(),
            anomaly: AnomalyConfig::default(),
            actions: BTreeMap::new(),
            network_history_capacity: default_network_history(),
        }
    }
}

fn default_freshness_ttl() -> u64 {
    30_000
}

fn default_replay_capacity() -> usize {
    10_000
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_network_history() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DomainRule;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: GatewayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.freshness_ttl_ms, 30_000);
        assert_eq!(cfg.replay_capacity, 10_000);
        assert_eq!(cfg.replay_sweep_interval_ms, 60_000);
        assert!(cfg.rebuild_replay_from_audit);
        assert!(cfg.allowlist.is_empty());
        assert_eq!(cfg.network_history_capacity, 10_000);
    }

    #[test]
    fn action_overrides_deserialize() {
        let cfg: GatewayConfig = serde_json::from_value(serde_json::json!({
            "allowlist": ["api.example.com"],
            "actions": {
                "model.download": {
                    "domain_rule": {"kind": "fixed", "domain": "models.example.org"},
                    "estimated_time_saved_seconds": 5
                }
            }
        }))
        .unwrap();
        let over = &cfg.actions[&ActionType::ModelDownload];
        assert_eq!(
            over.domain_rule,
            Some(DomainRule::Fixed {
                domain: "models.example.org".into()
            })
        );
        assert_eq!(over.estimated_time_saved_seconds, Some(5));
    }
}
