//! [`CommandGate`] – single interception point between the orchestrator and
//! the modules.
//!
//! Every command is checked by [`CommandGate::authorize`] before dispatch.
//! Registered [`DispatchRule`]s are evaluated in insertion order and the first
//! failure is returned unchanged:
//!
//! 1. **Mode restriction** ([`ModeRestrictionRule`]): the command category
//!    must be permitted in the current [`RobotMode`].  A refusal is
//!    [`CommandError::Rejected`] and maps to `409 Conflict` at the boundary.
//!    `stop` and `emergency_stop` are never refused by this rule, so a module
//!    can always be brought to rest whatever the mode.
//! 2. **Velocity cap** ([`VelocityCapRule`]): motion commands may not request
//!    more than the configured linear/angular speed.  A violation is
//!    [`CommandError::Invalid`].
//!
//! # Example
//!
//! ```
//! use conductor_kernel::command_gate::{CommandGate, DispatchContext};
//! use conductor_types::{Capability, Command, RobotMode};
//!
//! let gate = CommandGate::with_defaults(CommandGate::default_mode_rules(), 1.0);
//! let walk = Command::new("walk").with_parameters(serde_json::json!({"vx": 0.3}));
//! let ctx = DispatchContext::new("motion", Some(Capability::Motion), &walk);
//!
//! assert!(gate.authorize(RobotMode::Active, &ctx).is_ok());
//! assert!(gate.authorize(RobotMode::Emergency, &ctx).is_err());
//! ```

use conductor_types::{Capability, Command, CommandError, RobotMode};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// What a rule gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub module_id: &'a str,
    /// Resolved gating category; `None` for modules without capabilities.
    pub category: Option<Capability>,
    pub command: &'a Command,
}

impl<'a> DispatchContext<'a> {
    pub fn new(module_id: &'a str, category: Option<Capability>, command: &'a Command) -> Self {
        Self {
            module_id,
            category,
            command,
        }
    }
}

/// A single precondition a command must satisfy before dispatch.
pub trait DispatchRule: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    fn check(&self, mode: RobotMode, ctx: &DispatchContext<'_>) -> Result<(), CommandError>;
}

// ────────────────────────────────────────────────────────────────────────────
// CommandGate
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CommandGate {
    rules: Vec<Box<dyn DispatchRule>>,
}

impl CommandGate {
    /// A gate with no rules; every command passes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode restriction followed by the velocity cap.
    pub fn with_defaults(mode_rules: Vec<ModeRule>, max_velocity: f64) -> Self {
        let mut gate = Self::new();
        gate.add_rule(Box::new(ModeRestrictionRule::new(mode_rules)));
        gate.add_rule(Box::new(VelocityCapRule { max_velocity }));
        gate
    }

    /// Motion allowed only in `Active` and `Moving`; other categories
    /// unrestricted.
    pub fn default_mode_rules() -> Vec<ModeRule> {
        vec![ModeRule {
            category: Capability::Motion,
            allowed_modes: vec![RobotMode::Active, RobotMode::Moving],
        }]
    }

    pub fn add_rule(&mut self, rule: Box<dyn DispatchRule>) {
        self.rules.push(rule);
    }

    pub fn authorize(&self, mode: RobotMode, ctx: &DispatchContext<'_>) -> Result<(), CommandError> {
        for rule in &self.rules {
            if let Err(e) = rule.check(mode, ctx) {
                debug!(rule = rule.name(), module = ctx.module_id, error = %e, "command refused");
                return Err(e);
            }
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Modes in which commands of `category` may be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeRule {
    pub category: Capability,
    pub allowed_modes: Vec<RobotMode>,
}

/// Rejects commands whose category is not permitted in the current mode.
/// Categories without a rule are permitted everywhere, as are halting
/// commands ([`Command::is_halt`]).
pub struct ModeRestrictionRule {
    rules: Vec<ModeRule>,
}

impl ModeRestrictionRule {
    pub fn new(rules: Vec<ModeRule>) -> Self {
        Self { rules }
    }
}

impl DispatchRule for ModeRestrictionRule {
    fn name(&self) -> &str {
        "mode_restriction"
    }

    fn check(&self, mode: RobotMode, ctx: &DispatchContext<'_>) -> Result<(), CommandError> {
        let Some(category) = ctx.category else {
            return Ok(());
        };
        if ctx.command.is_halt() {
            return Ok(());
        }
        match self.rules.iter().find(|r| r.category == category) {
            Some(rule) if !rule.allowed_modes.contains(&mode) => Err(CommandError::Rejected {
                mode,
                reason: format!("{category} commands are not permitted in mode {mode}"),
            }),
            _ => Ok(()),
        }
    }
}

/// Rejects motion commands whose velocity parameters exceed `max_velocity`
/// in magnitude or are not finite.
pub struct VelocityCapRule {
    /// Maximum absolute value for `vx`, `vy`, `vyaw` and `velocity`.
    pub max_velocity: f64,
}

const VELOCITY_KEYS: [&str; 4] = ["vx", "vy", "vyaw", "velocity"];

impl DispatchRule for VelocityCapRule {
    fn name(&self) -> &str {
        "velocity_cap"
    }

    fn check(&self, _mode: RobotMode, ctx: &DispatchContext<'_>) -> Result<(), CommandError> {
        if ctx.category != Some(Capability::Motion) {
            return Ok(());
        }
        for key in VELOCITY_KEYS {
            let Some(raw) = ctx.command.parameters.get(key) else {
                continue;
            };
            let value = raw
                .as_f64()
                .ok_or_else(|| CommandError::Invalid(format!("parameter '{key}' must be a number")))?;
            if !value.is_finite() || value.abs() > self.max_velocity {
                return Err(CommandError::Invalid(format!(
                    "{key} {value} exceeds cap {}",
                    self.max_velocity
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate() -> CommandGate {
        CommandGate::with_defaults(CommandGate::default_mode_rules(), 1.0)
    }

    fn walk(vx: f64) -> Command {
        Command::new("walk").with_parameters(json!({ "vx": vx, "vy": 0.0, "vyaw": 0.0 }))
    }

    // ------------------------------------------------------------------ mode restriction

    #[test]
    fn motion_permitted_only_in_active_and_moving() {
        let g = gate();
        let cmd = walk(0.2);
        let ctx = DispatchContext::new("motion", Some(Capability::Motion), &cmd);

        for mode in RobotMode::ALL {
            let result = g.authorize(mode, &ctx);
            match mode {
                RobotMode::Active | RobotMode::Moving => assert!(result.is_ok(), "{mode}"),
                _ => assert!(
                    matches!(result, Err(CommandError::Rejected { mode: m, .. }) if m == mode),
                    "{mode}"
                ),
            }
        }
    }

    #[test]
    fn halting_commands_pass_in_every_mode() {
        let g = gate();
        for action in ["stop", "emergency_stop"] {
            let cmd = Command::new(action);
            let ctx = DispatchContext::new("motion", Some(Capability::Motion), &cmd);
            for mode in RobotMode::ALL {
                assert!(g.authorize(mode, &ctx).is_ok(), "{action} in {mode}");
            }
        }
    }

    #[test]
    fn halt_exemption_does_not_bypass_velocity_cap() {
        let cmd = Command::new("stop").with_parameters(json!({ "vx": 3.0 }));
        let ctx = DispatchContext::new("motion", Some(Capability::Motion), &cmd);
        assert!(matches!(
            gate().authorize(RobotMode::Degraded, &ctx),
            Err(CommandError::Invalid(_))
        ));
    }

    #[test]
    fn non_motion_categories_pass_in_every_mode() {
        let g = gate();
        let cmd = Command::new("set_color").with_parameters(json!({ "rgb": [255, 0, 0] }));
        let ctx = DispatchContext::new("led", Some(Capability::Led), &cmd);
        for mode in RobotMode::ALL {
            assert!(g.authorize(mode, &ctx).is_ok(), "{mode}");
        }
    }

    #[test]
    fn uncategorised_command_passes() {
        let g = gate();
        let cmd = Command::new("ping");
        let ctx = DispatchContext::new("bare", None, &cmd);
        assert!(g.authorize(RobotMode::Emergency, &ctx).is_ok());
    }

    #[test]
    fn configured_rules_replace_defaults() {
        let g = CommandGate::with_defaults(
            vec![ModeRule {
                category: Capability::Audio,
                allowed_modes: vec![RobotMode::Standby],
            }],
            1.0,
        );
        let say = Command::new("say");
        let ctx = DispatchContext::new("audio", Some(Capability::Audio), &say);
        assert!(g.authorize(RobotMode::Standby, &ctx).is_ok());
        assert!(g.authorize(RobotMode::Active, &ctx).is_err());
    }

    // ------------------------------------------------------------------ velocity cap

    #[test]
    fn velocity_within_cap_passes() {
        let cmd = walk(-1.0);
        let ctx = DispatchContext::new("motion", Some(Capability::Motion), &cmd);
        assert!(gate().authorize(RobotMode::Active, &ctx).is_ok());
    }

    #[test]
    fn velocity_over_cap_is_invalid() {
        let cmd = walk(1.5);
        let ctx = DispatchContext::new("motion", Some(Capability::Motion), &cmd);
        assert!(matches!(
            gate().authorize(RobotMode::Active, &ctx),
            Err(CommandError::Invalid(_))
        ));
    }

    #[test]
    fn non_numeric_velocity_is_invalid() {
        let cmd = Command::new("walk").with_parameters(json!({ "vyaw": "fast" }));
        let ctx = DispatchContext::new("motion", Some(Capability::Motion), &cmd);
        assert!(matches!(
            gate().authorize(RobotMode::Moving, &ctx),
            Err(CommandError::Invalid(_))
        ));
    }

    #[test]
    fn mode_rejection_wins_over_velocity_check() {
        let cmd = walk(5.0);
        let ctx = DispatchContext::new("motion", Some(Capability::Motion), &cmd);
        assert!(matches!(
            gate().authorize(RobotMode::Charging, &ctx),
            Err(CommandError::Rejected { .. })
        ));
    }

    #[test]
    fn velocity_cap_ignores_other_categories() {
        let cmd = Command::new("play").with_parameters(json!({ "velocity": 99.0 }));
        let ctx = DispatchContext::new("audio", Some(Capability::Audio), &cmd);
        assert!(gate().authorize(RobotMode::Idle, &ctx).is_ok());
    }

    #[test]
    fn empty_gate_allows_everything() {
        let g = CommandGate::new();
        let cmd = walk(9.0);
        let ctx = DispatchContext::new("motion", Some(Capability::Motion), &cmd);
        assert!(g.authorize(RobotMode::Emergency, &ctx).is_ok());
    }
}
