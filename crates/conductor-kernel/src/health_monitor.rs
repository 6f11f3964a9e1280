//! [`HealthMonitor`] – per-module heartbeat tracking.
//!
//! Every module is expected to heartbeat at least once per
//! `heartbeat_interval`.  [`HealthMonitor::sweep`] counts the whole intervals
//! elapsed since the last heartbeat and derives a [`HealthStatus`]:
//!
//! | Missed heartbeats | Status |
//! |-------------------|--------|
//! | `< degraded_after_missed` | Healthy |
//! | `>= degraded_after_missed` | Degraded |
//! | `>= unresponsive_after_missed` | Unresponsive |
//!
//! Alerts are emitted only when a module's status changes, so a module that
//! stays silent produces exactly one [`HealthAlert::Degraded`] and exactly one
//! [`HealthAlert::Unresponsive`] no matter how often the sweep runs.
//!
//! The monitor never restarts anything; callers turn alerts into state machine
//! events and restart decisions.
//!
//! # Example
//!
//! ```
//! use conductor_kernel::health_monitor::{HealthAlert, HealthConfig, HealthMonitor};
//! use conductor_types::MonoTime;
//!
//! let mut hm = HealthMonitor::new(HealthConfig::default());
//! hm.register("motion", MonoTime::from_millis(0));
//!
//! // 3.5 s of silence with a 1 s interval: three missed heartbeats.
//! let alerts = hm.sweep(MonoTime::from_millis(3_500));
//! assert!(matches!(alerts[0], HealthAlert::Unresponsive { missed: 3, .. }));
//! ```

use std::collections::HashMap;
use std::time::Duration;

use conductor_types::{HealthRecord, HealthStatus, MonoTime, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub heartbeat_interval_ms: u64,
    pub degraded_after_missed: u32,
    pub unresponsive_after_missed: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            degraded_after_missed: 1,
            unresponsive_after_missed: 3,
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// A status change worth reacting to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAlert {
    Degraded { module_id: String, missed: u32 },
    Unresponsive { module_id: String, missed: u32 },
    Recovered { module_id: String },
}

impl HealthAlert {
    pub fn module_id(&self) -> &str {
        match self {
            HealthAlert::Degraded { module_id, .. }
            | HealthAlert::Unresponsive { module_id, .. }
            | HealthAlert::Recovered { module_id } => module_id,
        }
    }
}

struct Entry {
    last_heartbeat: MonoTime,
    last_heartbeat_at: Option<Timestamp>,
    missed: u32,
    status: HealthStatus,
    /// Set by [`HealthMonitor::mark_degraded`]; cleared by the next heartbeat.
    forced_degraded: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// HealthMonitor
// ────────────────────────────────────────────────────────────────────────────

pub struct HealthMonitor {
    config: HealthConfig,
    entries: HashMap<String, Entry>,
    /// Registration order, for stable record listings.
    order: Vec<String>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start tracking `module_id` as Healthy with its deadline measured from
    /// `now`.  Re-registering resets the record.
    pub fn register(&mut self, module_id: &str, now: MonoTime) {
        if !self.entries.contains_key(module_id) {
            self.order.push(module_id.to_string());
        }
        self.entries.insert(
            module_id.to_string(),
            Entry {
                last_heartbeat: now,
                last_heartbeat_at: None,
                missed: 0,
                status: HealthStatus::Healthy,
                forced_degraded: false,
            },
        );
    }

    /// Stop tracking a module that was stopped or permanently failed.
    pub fn unregister(&mut self, module_id: &str) {
        self.entries.remove(module_id);
        self.order.retain(|id| id != module_id);
    }

    /// Record a heartbeat.  Returns [`HealthAlert::Recovered`] when the module
    /// was not Healthy.  No-op for unknown modules.
    pub fn heartbeat(&mut self, module_id: &str, now: MonoTime) -> Option<HealthAlert> {
        let entry = self.entries.get_mut(module_id)?;
        if now > entry.last_heartbeat {
            entry.last_heartbeat = now;
        }
        entry.last_heartbeat_at = Some(Timestamp::at(now));
        entry.missed = 0;
        entry.forced_degraded = false;

        if entry.status == HealthStatus::Healthy {
            return None;
        }
        info!(module = module_id, previous = ?entry.status, "module recovered");
        entry.status = HealthStatus::Healthy;
        Some(HealthAlert::Recovered {
            module_id: module_id.to_string(),
        })
    }

    /// Force a Healthy module to Degraded (e.g. after a command timeout).
    pub fn mark_degraded(&mut self, module_id: &str, reason: &str) -> Option<HealthAlert> {
        let entry = self.entries.get_mut(module_id)?;
        entry.forced_degraded = true;
        if entry.status != HealthStatus::Healthy {
            return None;
        }
        warn!(module = module_id, reason, "module marked degraded");
        entry.status = HealthStatus::Degraded;
        Some(HealthAlert::Degraded {
            module_id: module_id.to_string(),
            missed: entry.missed,
        })
    }

    /// Re-evaluate every module at `now` and return one alert per status
    /// change.
    pub fn sweep(&mut self, now: MonoTime) -> Vec<HealthAlert> {
        let interval = self.config.heartbeat_interval();
        let mut alerts = Vec::new();

        for module_id in &self.order {
            let Some(entry) = self.entries.get_mut(module_id) else {
                continue;
            };
            let elapsed = now.duration_since(entry.last_heartbeat);
            let missed = u32::try_from(elapsed.as_nanos() / interval.as_nanos()).unwrap_or(u32::MAX);
            entry.missed = missed;

            let status = if missed >= self.config.unresponsive_after_missed {
                HealthStatus::Unresponsive
            } else if missed >= self.config.degraded_after_missed || entry.forced_degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            if status == entry.status {
                continue;
            }

            let previous = entry.status;
            entry.status = status;
            let alert = match status {
                HealthStatus::Unresponsive => {
                    warn!(module = %module_id, missed, "module unresponsive");
                    HealthAlert::Unresponsive {
                        module_id: module_id.clone(),
                        missed,
                    }
                }
                HealthStatus::Degraded if previous == HealthStatus::Healthy => {
                    warn!(module = %module_id, missed, "module degraded");
                    HealthAlert::Degraded {
                        module_id: module_id.clone(),
                        missed,
                    }
                }
                // Unresponsive never falls back to Degraded without a heartbeat.
                HealthStatus::Degraded => continue,
                HealthStatus::Healthy => HealthAlert::Recovered {
                    module_id: module_id.clone(),
                },
            };
            alerts.push(alert);
        }
        alerts
    }

    pub fn status(&self, module_id: &str) -> Option<HealthStatus> {
        self.entries.get(module_id).map(|e| e.status)
    }

    /// `true` when every registered module is Healthy.
    pub fn all_healthy(&self) -> bool {
        self.entries.values().all(|e| e.status == HealthStatus::Healthy)
    }

    pub fn record(&self, module_id: &str) -> Option<HealthRecord> {
        self.entries.get(module_id).map(|e| HealthRecord {
            module_id: module_id.to_string(),
            last_heartbeat_at: e.last_heartbeat_at,
            consecutive_missed_heartbeats: e.missed,
            status: e.status,
        })
    }

    /// Snapshot of every record, in registration order.
    pub fn records(&self) -> Vec<HealthRecord> {
        self.order.iter().filter_map(|id| self.record(id)).collect()
    }
}
