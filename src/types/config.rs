//! Configuration structures.
//!
//! Each subsystem defines its own config next to its implementation
//! (`BreakerConfig`, `HibernationConfig`, ...); this module aggregates them
//! into the single document loaded at process start.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::alerts::AlertConfig;
use crate::breaker::BreakerConfig;
use crate::hibernate::HibernationConfig;
use crate::supervisor::SupervisorConfig;

/// Global orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorConfig {
    /// Default breaker policy applied to every registered component.
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Hibernation policy.
    #[serde(default)]
    pub hibernation: HibernationConfig,

    /// Alert rate limiting.
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Supervisory loop cadence.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Lifecycle (start/stop) behavior.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Start/stop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Grace period per component during `stop_all` to quiesce in-flight
    /// calls before forced termination.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Polling interval while waiting for in-flight calls to drain.
    #[serde(with = "humantime_serde")]
    pub drain_poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            drain_poll_interval: Duration::from_millis(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrips() {
        let config = OrchestratorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.lifecycle.stop_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: OrchestratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(
            config.lifecycle.drain_poll_interval,
            Duration::from_millis(20)
        );
    }
}
