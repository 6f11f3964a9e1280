//! [`RestartPolicy`] – bounded auto-restart with exponential backoff.
//!
//! The policy is plain configuration; [`RestartTracker`] counts attempts per
//! module and turns the policy into a [`RestartDecision`].  Attempts are
//! counted over the lifetime of the process: once a module has used
//! `max_attempts` restarts it is given up on and stays `Failed`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart `attempt` (1-based):
    /// `initial_backoff * multiplier^(attempt-1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Every delay the policy would ever wait, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|a| self.backoff(a)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Wait `delay`, then perform restart number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; the module is permanently failed.
    GiveUp { attempts: u32 },
    /// The policy does not allow restarts.
    Disabled,
}

#[derive(Debug, Default)]
pub struct RestartTracker {
    attempts: HashMap<String, u32>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one attempt for `module_id` if the policy allows it.
    pub fn next(&mut self, module_id: &str, policy: &RestartPolicy) -> RestartDecision {
        if !policy.enabled {
            return RestartDecision::Disabled;
        }
        let used = self.attempts.entry(module_id.to_string()).or_insert(0);
        if *used >= policy.max_attempts {
            return RestartDecision::GiveUp { attempts: *used };
        }
        *used += 1;
        RestartDecision::Retry {
            attempt: *used,
            delay: policy.backoff(*used),
        }
    }

    pub fn attempts(&self, module_id: &str) -> u32 {
        self.attempts.get(module_id).copied().unwrap_or(0)
    }
}
