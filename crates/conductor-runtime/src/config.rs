//! Orchestrator configuration.
//!
//! Every knob has a serde default, so an empty TOML table yields a working
//! orchestrator.

use std::collections::BTreeMap;
use std::time::Duration;

use conductor_kernel::{CommandGate, ExtraTransition, HealthConfig, ModeRule, RestartPolicy};
use conductor_perception::FusionConfig;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on a single module command.
    pub command_timeout_ms: u64,
    /// Upper bound on each `initialize` and `start` call.
    pub startup_timeout_ms: u64,
    /// Time each module gets to stop during shutdown.
    pub shutdown_grace_ms: u64,
    /// Cap applied to motion command velocity parameters.
    pub max_velocity: f64,
    pub bus_capacity: usize,
    pub health: HealthConfig,
    pub fusion: FusionConfig,
    pub metrics: MetricsConfig,
    /// Default restart policy.
    pub restart: RestartPolicy,
    /// Per-module overrides of [`restart`](Self::restart).
    pub restart_overrides: BTreeMap<String, RestartPolicy>,
    pub mode_rules: Vec<ModeRule>,
    pub extra_transitions: Vec<ExtraTransition>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 2_000,
            startup_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
            max_velocity: 1.0,
            bus_capacity: 1_024,
            health: HealthConfig::default(),
            fusion: FusionConfig::default(),
            metrics: MetricsConfig::default(),
            restart: RestartPolicy::default(),
            restart_overrides: BTreeMap::new(),
            mode_rules: CommandGate::default_mode_rules(),
            extra_transitions: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn restart_policy_for(&self, module_id: &str) -> &RestartPolicy {
        self.restart_overrides.get(module_id).unwrap_or(&self.restart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{Capability, RobotMode};

    #[test]
    fn defaults() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.command_timeout(), Duration::from_secs(2));
        assert_eq!(c.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(c.health.unresponsive_after_missed, 3);
        assert_eq!(c.fusion.window_ms, 100);
        assert_eq!(c.metrics.window_ms, 60_000);
        assert_eq!(c.mode_rules[0].category, Capability::Motion);
    }

    #[test]
    fn restart_override_wins() {
        let mut c = OrchestratorConfig::default();
        c.restart_overrides.insert(
            "motion".into(),
            RestartPolicy {
                enabled: true,
                ..RestartPolicy::default()
            },
        );
        assert!(c.restart_policy_for("motion").enabled);
        assert!(!c.restart_policy_for("audio").enabled);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: OrchestratorConfig = serde_json::from_value(serde_json::json!({
            "command_timeout_ms": 500,
            "fusion": { "expected": { "imu": "body" } },
            "mode_rules": [{ "category": "audio", "allowed_modes": ["standby"] }]
        }))
        .unwrap();
        assert_eq!(c.command_timeout_ms, 500);
        assert_eq!(c.fusion.window_ms, 100);
        assert_eq!(c.fusion.expected.get("imu").map(String::as_str), Some("body"));
        assert_eq!(c.mode_rules[0].allowed_modes, vec![RobotMode::Standby]);
    }
}
