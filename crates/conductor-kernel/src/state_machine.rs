//! [`StateMachine`] – authoritative robot operating mode.
//!
//! The machine holds exactly one [`RobotState`] and mutates it only through
//! [`StateMachine::apply`].  Each call resolves the event against the
//! transition table below; anything not in the table is returned as
//! [`TransitionError::Illegal`].
//!
//! | From | Event | To |
//! |------|-------|----|
//! | Idle | `start_requested` | Standby |
//! | Standby | `activate` | Active |
//! | Active | `deactivate` | Standby |
//! | Active | `motion_command` | Moving |
//! | Moving | `motion_command` | Moving (no change) |
//! | Moving | `motion_complete` / `stop_command` | Active |
//! | Standby, Active | `charging_started` | Charging |
//! | Charging | `charging_complete` | Standby |
//! | any but Emergency | `critical_health_failure` | Emergency |
//! | any | `emergency_stop` | Emergency (no change when already there) |
//! | any but Error, Emergency | `module_fatal_error` | Error |
//! | Emergency | `emergency_reset` (all modules healthy) | Standby |
//! | Error | `error_reset` | Standby |
//! | any but Degraded, Error, Emergency | `module_degraded` | Degraded |
//! | Degraded | `health_recovered` | mode Degraded was entered from |
//!
//! Additional edges can be configured with [`ExtraTransition`]; they are
//! consulted only when the built-in table has no entry.
//!
//! # Example
//!
//! ```
//! use conductor_kernel::state_machine::{StateMachine, TransitionContext};
//! use conductor_types::{ModeEvent, RobotMode};
//!
//! let mut sm = StateMachine::new();
//! sm.apply(ModeEvent::StartRequested, &TransitionContext::new("boot")).unwrap();
//! sm.apply(ModeEvent::Activate, &TransitionContext::new("operator")).unwrap();
//! assert_eq!(sm.mode(), RobotMode::Active);
//!
//! // Reset from Active is not in the table.
//! assert!(sm.apply(ModeEvent::ErrorReset, &TransitionContext::new("?")).is_err());
//! ```

use std::collections::VecDeque;

use conductor_types::{ModeEvent, RobotMode, RobotState, Timestamp, TransitionError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Number of applied transitions kept for status reporting.
pub const HISTORY_CAPACITY: usize = 64;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// A configured edge added on top of the built-in table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraTransition {
    pub from: RobotMode,
    pub event: ModeEvent,
    pub to: RobotMode,
}

/// One applied mode change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RobotMode,
    pub to: RobotMode,
    pub event: ModeEvent,
    pub reason: String,
    pub at: Timestamp,
}

/// Inputs a transition may depend on besides the current mode.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub reason: String,
    /// Guard for `emergency_reset`.
    pub all_modules_healthy: bool,
    pub at: Timestamp,
}

impl TransitionContext {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            all_modules_healthy: true,
            at: Timestamp::now(),
        }
    }

    pub fn with_health(mut self, all_modules_healthy: bool) -> Self {
        self.all_modules_healthy = all_modules_healthy;
        self
    }

    pub fn at(mut self, at: Timestamp) -> Self {
        self.at = at;
        self
    }
}

enum Resolution {
    To(RobotMode),
    Unchanged,
}

// ────────────────────────────────────────────────────────────────────────────
// StateMachine
// ────────────────────────────────────────────────────────────────────────────

pub struct StateMachine {
    state: RobotState,
    /// Mode to return to on `health_recovered`; set while in Degraded.
    degraded_from: Option<RobotMode>,
    extra: Vec<ExtraTransition>,
    history: VecDeque<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: RobotState::initial(),
            degraded_from: None,
            extra: Vec::new(),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }
}

impl StateMachine {
    /// A machine in `Idle` with only the built-in table.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extra_transitions(extra: Vec<ExtraTransition>) -> Self {
        Self {
            extra,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> RobotMode {
        self.state.mode
    }

    /// Snapshot copy of the current state.
    pub fn state(&self) -> RobotState {
        self.state.clone()
    }

    pub fn degraded_from(&self) -> Option<RobotMode> {
        self.degraded_from
    }

    /// Applied transitions, oldest first.
    pub fn history(&self) -> Vec<Transition> {
        self.history.iter().cloned().collect()
    }

    /// Apply `event` to the current mode.
    ///
    /// Returns `Ok(Some(transition))` when the mode changed, `Ok(None)` for
    /// accepted events that leave the mode unchanged, and an error when the
    /// table has no entry or a guard refuses.
    pub fn apply(
        &mut self,
        event: ModeEvent,
        ctx: &TransitionContext,
    ) -> Result<Option<Transition>, TransitionError> {
        let from = self.state.mode;
        let to = match self.resolve(event, ctx)? {
            Resolution::Unchanged => {
                self.track_motion_while_degraded(event);
                debug!(mode = %from, event = %event, "event accepted without mode change");
                return Ok(None);
            }
            Resolution::To(to) => to,
        };

        if to == RobotMode::Degraded {
            self.degraded_from = Some(from);
        } else {
            self.degraded_from = None;
        }

        self.state = RobotState {
            mode: to,
            entered_at: ctx.at,
            reason: ctx.reason.clone(),
        };

        let transition = Transition {
            from,
            to,
            event,
            reason: ctx.reason.clone(),
            at: ctx.at,
        };
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(transition.clone());

        info!(from = %from, to = %to, event = %event, reason = %ctx.reason, "mode transition");
        Ok(Some(transition))
    }

    fn resolve(
        &self,
        event: ModeEvent,
        ctx: &TransitionContext,
    ) -> Result<Resolution, TransitionError> {
        use ModeEvent as E;
        use RobotMode as M;

        let from = self.state.mode;
        let resolved = match (from, event) {
            (M::Emergency, E::EmergencyStop) => Some(Resolution::Unchanged),
            (_, E::EmergencyStop) => Some(Resolution::To(M::Emergency)),
            (M::Emergency, E::CriticalHealthFailure) => None,
            (_, E::CriticalHealthFailure) => Some(Resolution::To(M::Emergency)),
            (M::Emergency | M::Error, E::ModuleFatalError) => None,
            (_, E::ModuleFatalError) => Some(Resolution::To(M::Error)),
            (M::Emergency, E::EmergencyReset) => {
                if !ctx.all_modules_healthy {
                    return Err(TransitionError::GuardFailed {
                        from,
                        event,
                        reason: "not all modules are healthy".to_string(),
                    });
                }
                Some(Resolution::To(M::Standby))
            }
            (M::Error, E::ErrorReset) => Some(Resolution::To(M::Standby)),
            (M::Degraded | M::Error | M::Emergency, E::ModuleDegraded) => None,
            (_, E::ModuleDegraded) => Some(Resolution::To(M::Degraded)),
            (M::Degraded, E::HealthRecovered) => Some(Resolution::To(
                self.degraded_from.unwrap_or(M::Standby),
            )),
            (M::Degraded, E::MotionComplete | E::StopCommand)
                if self.degraded_from == Some(M::Moving) =>
            {
                Some(Resolution::Unchanged)
            }
            (M::Idle, E::StartRequested) => Some(Resolution::To(M::Standby)),
            (M::Standby, E::Activate) => Some(Resolution::To(M::Active)),
            (M::Active, E::Deactivate) => Some(Resolution::To(M::Standby)),
            (M::Active, E::MotionCommand) => Some(Resolution::To(M::Moving)),
            (M::Moving, E::MotionCommand) => Some(Resolution::Unchanged),
            (M::Moving, E::MotionComplete | E::StopCommand) => Some(Resolution::To(M::Active)),
            (M::Standby | M::Active, E::ChargingStarted) => Some(Resolution::To(M::Charging)),
            (M::Charging, E::ChargingComplete) => Some(Resolution::To(M::Standby)),
            _ => None,
        };

        resolved
            .or_else(|| {
                self.extra
                    .iter()
                    .find(|t| t.from == from && t.event == event)
                    .map(|t| Resolution::To(t.to))
            })
            .ok_or(TransitionError::Illegal { from, event })
    }

    /// A motion that ends while Degraded means recovery returns to Active.
    fn track_motion_while_degraded(&mut self, event: ModeEvent) {
        if self.state.mode == RobotMode::Degraded
            && matches!(event, ModeEvent::MotionComplete | ModeEvent::StopCommand)
        {
            self.degraded_from = Some(RobotMode::Active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TransitionContext {
        TransitionContext::new("test")
    }

    fn machine_in(path: &[ModeEvent]) -> StateMachine {
        let mut sm = StateMachine::new();
        for ev in path {
            sm.apply(*ev, &ctx()).unwrap();
        }
        sm
    }

    fn active() -> StateMachine {
        machine_in(&[ModeEvent::StartRequested, ModeEvent::Activate])
    }

    // ------------------------------------------------------------------ basic path

    #[test]
    fn initial_mode_is_idle() {
        let sm = StateMachine::new();
        assert_eq!(sm.mode(), RobotMode::Idle);
        assert!(sm.history().is_empty());
    }

    #[test]
    fn nominal_motion_cycle() {
        let mut sm = active();
        sm.apply(ModeEvent::MotionCommand, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Moving);

        // Further motion commands keep the robot moving.
        assert!(sm.apply(ModeEvent::MotionCommand, &ctx()).unwrap().is_none());
        assert_eq!(sm.mode(), RobotMode::Moving);

        sm.apply(ModeEvent::MotionComplete, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Active);

        sm.apply(ModeEvent::MotionCommand, &ctx()).unwrap();
        sm.apply(ModeEvent::StopCommand, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Active);
    }

    #[test]
    fn illegal_transition_is_rejected_without_change() {
        let mut sm = StateMachine::new();
        let err = sm.apply(ModeEvent::MotionCommand, &ctx()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: RobotMode::Idle,
                event: ModeEvent::MotionCommand
            }
        );
        assert_eq!(sm.mode(), RobotMode::Idle);
        assert!(sm.history().is_empty());
    }

    #[test]
    fn charging_round_trip() {
        let mut sm = machine_in(&[ModeEvent::StartRequested]);
        sm.apply(ModeEvent::ChargingStarted, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Charging);
        assert!(sm.apply(ModeEvent::Activate, &ctx()).is_err());
        sm.apply(ModeEvent::ChargingComplete, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Standby);
    }

    // ------------------------------------------------------------------ emergency

    #[test]
    fn emergency_is_one_way_until_reset() {
        let mut sm = active();
        sm.apply(ModeEvent::MotionCommand, &ctx()).unwrap();
        sm.apply(ModeEvent::EmergencyStop, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Emergency);

        for ev in [
            ModeEvent::MotionCommand,
            ModeEvent::MotionComplete,
            ModeEvent::Activate,
            ModeEvent::ErrorReset,
            ModeEvent::ModuleFatalError,
            ModeEvent::ModuleDegraded,
            ModeEvent::CriticalHealthFailure,
        ] {
            assert!(sm.apply(ev, &ctx()).is_err(), "{ev} left Emergency");
            assert_eq!(sm.mode(), RobotMode::Emergency);
        }

        // Repeated emergency stop is accepted as a no-op.
        assert!(sm.apply(ModeEvent::EmergencyStop, &ctx()).unwrap().is_none());
    }

    #[test]
    fn emergency_reset_requires_healthy_modules() {
        let mut sm = active();
        sm.apply(ModeEvent::CriticalHealthFailure, &ctx()).unwrap();

        let unhealthy = ctx().with_health(false);
        let err = sm.apply(ModeEvent::EmergencyReset, &unhealthy).unwrap_err();
        assert!(matches!(err, TransitionError::GuardFailed { .. }));
        assert_eq!(sm.mode(), RobotMode::Emergency);

        sm.apply(ModeEvent::EmergencyReset, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Standby);
    }

    #[test]
    fn fatal_error_and_reset() {
        let mut sm = active();
        sm.apply(ModeEvent::ModuleFatalError, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Error);
        assert!(sm.apply(ModeEvent::ModuleFatalError, &ctx()).is_err());
        sm.apply(ModeEvent::ErrorReset, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Standby);
    }

    // ------------------------------------------------------------------ degraded

    #[test]
    fn degraded_returns_to_prior_mode() {
        let mut sm = active();
        sm.apply(ModeEvent::ModuleDegraded, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Degraded);
        assert_eq!(sm.degraded_from(), Some(RobotMode::Active));

        // A second degradation does not stack.
        assert!(sm.apply(ModeEvent::ModuleDegraded, &ctx()).is_err());

        sm.apply(ModeEvent::HealthRecovered, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Active);
        assert_eq!(sm.degraded_from(), None);
    }

    #[test]
    fn motion_ending_while_degraded_recovers_to_active() {
        let mut sm = active();
        sm.apply(ModeEvent::MotionCommand, &ctx()).unwrap();
        sm.apply(ModeEvent::ModuleDegraded, &ctx()).unwrap();
        assert_eq!(sm.degraded_from(), Some(RobotMode::Moving));

        assert!(sm.apply(ModeEvent::MotionComplete, &ctx()).unwrap().is_none());
        sm.apply(ModeEvent::HealthRecovered, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Active);
    }

    #[test]
    fn fatal_error_from_degraded_clears_prior_mode() {
        let mut sm = active();
        sm.apply(ModeEvent::ModuleDegraded, &ctx()).unwrap();
        sm.apply(ModeEvent::ModuleFatalError, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Error);
        assert_eq!(sm.degraded_from(), None);
        assert!(sm.apply(ModeEvent::HealthRecovered, &ctx()).is_err());
    }

    // ------------------------------------------------------------------ table replay

    /// Reference table used to replay event sequences step by step.
    fn expected(from: RobotMode, event: ModeEvent, prior: Option<RobotMode>) -> Option<RobotMode> {
        use ModeEvent as E;
        use RobotMode as M;
        match (from, event) {
            (_, E::EmergencyStop) => Some(M::Emergency),
            (M::Emergency, E::EmergencyReset) => Some(M::Standby),
            (M::Emergency, _) => None,
            (_, E::CriticalHealthFailure) => Some(M::Emergency),
            (M::Error, E::ErrorReset) => Some(M::Standby),
            (M::Error, _) => None,
            (_, E::ModuleFatalError) => Some(M::Error),
            (M::Degraded, E::HealthRecovered) => prior.or(Some(M::Standby)),
            (M::Degraded, E::MotionComplete | E::StopCommand) if prior == Some(M::Moving) => {
                Some(M::Degraded)
            }
            (M::Degraded, _) => None,
            (_, E::ModuleDegraded) => Some(M::Degraded),
            (M::Idle, E::StartRequested) => Some(M::Standby),
            (M::Standby, E::Activate) => Some(M::Active),
            (M::Active, E::Deactivate) => Some(M::Standby),
            (M::Active | M::Moving, E::MotionCommand) => Some(M::Moving),
            (M::Moving, E::MotionComplete | E::StopCommand) => Some(M::Active),
            (M::Standby | M::Active, E::ChargingStarted) => Some(M::Charging),
            (M::Charging, E::ChargingComplete) => Some(M::Standby),
            _ => None,
        }
    }

    #[test]
    fn replaying_sequences_matches_table() {
        const EVENTS: [ModeEvent; 15] = [
            ModeEvent::StartRequested,
            ModeEvent::Activate,
            ModeEvent::Deactivate,
            ModeEvent::MotionCommand,
            ModeEvent::MotionComplete,
            ModeEvent::StopCommand,
            ModeEvent::ChargingStarted,
            ModeEvent::ChargingComplete,
            ModeEvent::CriticalHealthFailure,
            ModeEvent::EmergencyStop,
            ModeEvent::ModuleFatalError,
            ModeEvent::ModuleDegraded,
            ModeEvent::HealthRecovered,
            ModeEvent::EmergencyReset,
            ModeEvent::ErrorReset,
        ];

        // Deterministic pseudo-random walk over the event alphabet.
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..200 {
            let mut sm = StateMachine::new();
            let mut prior: Option<RobotMode> = None;
            for _ in 0..40 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let ev = EVENTS[(seed % EVENTS.len() as u64) as usize];
                let from = sm.mode();
                let want = expected(from, ev, prior);
                let got = sm.apply(ev, &ctx());

                match want {
                    Some(to) => {
                        assert!(got.is_ok(), "{from} --{ev}--> expected {to}");
                        assert_eq!(sm.mode(), to);
                        if to == RobotMode::Degraded && from != RobotMode::Degraded {
                            prior = Some(from);
                        } else if from == RobotMode::Degraded && to == RobotMode::Degraded {
                            prior = Some(RobotMode::Active);
                        } else if to != RobotMode::Degraded {
                            prior = None;
                        }
                    }
                    None => {
                        assert!(got.is_err(), "{from} --{ev}--> should be rejected");
                        assert_eq!(sm.mode(), from);
                    }
                }
                assert!(RobotMode::ALL.contains(&sm.mode()));
            }
        }
    }

    // ------------------------------------------------------------------ config + history

    #[test]
    fn extra_transitions_extend_the_table() {
        let mut sm = StateMachine::with_extra_transitions(vec![ExtraTransition {
            from: RobotMode::Idle,
            event: ModeEvent::ChargingStarted,
            to: RobotMode::Charging,
        }]);
        sm.apply(ModeEvent::ChargingStarted, &ctx()).unwrap();
        assert_eq!(sm.mode(), RobotMode::Charging);
    }

    #[test]
    fn history_is_bounded() {
        let mut sm = machine_in(&[ModeEvent::StartRequested]);
        for _ in 0..(HISTORY_CAPACITY + 10) {
            sm.apply(ModeEvent::Activate, &ctx()).unwrap();
            sm.apply(ModeEvent::Deactivate, &ctx()).unwrap();
        }
        let history = sm.history();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history.last().map(|t| t.to), Some(RobotMode::Standby));
    }

    #[test]
    fn state_records_reason() {
        let mut sm = StateMachine::new();
        sm.apply(ModeEvent::StartRequested, &TransitionContext::new("operator"))
            .unwrap();
        assert_eq!(sm.state().reason, "operator");
    }
}
