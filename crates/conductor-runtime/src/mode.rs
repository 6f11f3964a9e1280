//! [`ModeController`] – the single serialising gate around the robot mode.
//!
//! All reads and writes of [`RobotState`] go through one mutex-guarded
//! [`StateMachine`], so transitions are atomic and totally ordered.  A request
//! that arrives while another transition is being applied waits for the lock
//! and is then evaluated against the resulting mode.  Every other component
//! reads snapshots from a [`watch`] channel.
//!
//! The command gate lives behind the same lock: checking whether a command is
//! permitted and applying the `motion_command` transition it implies happen
//! in one critical section, so no transition can slip in between.
//!
//! Every mode change is published on the bus as an
//! [`EventPayload::ModeChanged`] health event.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use conductor_kernel::{
    CommandGate, DispatchContext, StateMachine, Transition, TransitionContext,
};
use conductor_middleware::EventBus;
use conductor_types::{
    Capability, Command, CommandError, Event, EventPayload, ModeEvent, RobotMode, RobotState,
    TransitionError,
};
use tokio::sync::watch;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::metrics::MetricsCollector;

/// Source id used for events the controller publishes.
pub const STATE_SOURCE: &str = "conductor::state";

/// How an admitted command affected the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The command started a motion (`Active` → `Moving`).
    StartedMotion,
    Unchanged,
}

struct Inner {
    machine: StateMachine,
    gate: CommandGate,
    /// Active degradation sources (module ids, `"fusion"`).
    degraded_by: BTreeSet<String>,
}

pub struct ModeController {
    inner: Mutex<Inner>,
    snapshot: watch::Sender<RobotState>,
    bus: EventBus,
    metrics: Arc<MetricsCollector>,
}

impl ModeController {
    pub fn new(config: &OrchestratorConfig, bus: EventBus, metrics: Arc<MetricsCollector>) -> Self {
        let machine = StateMachine::with_extra_transitions(config.extra_transitions.clone());
        let gate = CommandGate::with_defaults(config.mode_rules.clone(), config.max_velocity);
        let (snapshot, _) = watch::channel(machine.state());
        Self {
            inner: Mutex::new(Inner {
                machine,
                gate,
                degraded_by: BTreeSet::new(),
            }),
            snapshot,
            bus,
            metrics,
        }
    }

    pub fn mode(&self) -> RobotMode {
        self.snapshot.borrow().mode
    }

    pub fn state(&self) -> RobotState {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RobotState> {
        self.snapshot.subscribe()
    }

    pub fn history(&self) -> Vec<Transition> {
        self.lock().machine.history()
    }

    /// Apply `event` with the given reason.
    pub fn apply(
        &self,
        event: ModeEvent,
        reason: &str,
        all_modules_healthy: bool,
    ) -> Result<Option<Transition>, TransitionError> {
        let mut inner = self.lock();
        let ctx = TransitionContext::new(reason).with_health(all_modules_healthy);
        self.apply_locked(&mut inner, event, &ctx)
    }

    /// Gate a command against the current mode and apply the transition it
    /// implies, atomically.
    pub fn admit(
        &self,
        module_id: &str,
        category: Option<Capability>,
        command: &Command,
    ) -> Result<Admission, CommandError> {
        let mut inner = self.lock();
        let mode = inner.machine.mode();
        inner
            .gate
            .authorize(mode, &DispatchContext::new(module_id, category, command))?;

        if category != Some(Capability::Motion) {
            return Ok(Admission::Unchanged);
        }
        let reason = format!("{} sent to {module_id}", command.action);
        if command.is_halt() {
            // Moving returns to Active; a motion interrupted by Degraded is
            // marked as ended so recovery lands in Active.
            if matches!(mode, RobotMode::Moving | RobotMode::Degraded) {
                let ctx = TransitionContext::new(reason);
                if let Err(e) = self.apply_locked(&mut inner, ModeEvent::StopCommand, &ctx) {
                    debug!(module = module_id, error = %e, "halt admitted without mode change");
                }
            }
            return Ok(Admission::Unchanged);
        }

        let ctx = TransitionContext::new(reason);
        match self.apply_locked(&mut inner, ModeEvent::MotionCommand, &ctx) {
            Ok(Some(t)) if t.to == RobotMode::Moving => Ok(Admission::StartedMotion),
            Ok(_) => Ok(Admission::Unchanged),
            // The gate already vetted the mode; a configured table that
            // disagrees is reported as a rejection.
            Err(e) => Err(CommandError::Rejected {
                mode,
                reason: e.to_string(),
            }),
        }
    }

    /// Record a degradation source and enter `Degraded` when possible.
    pub fn degrade(&self, source: &str, reason: &str) -> Option<Transition> {
        let mut inner = self.lock();
        inner.degraded_by.insert(source.to_string());
        let ctx = TransitionContext::new(reason);
        match self.apply_locked(&mut inner, ModeEvent::ModuleDegraded, &ctx) {
            Ok(t) => t,
            Err(e) => {
                debug!(source, error = %e, "degradation recorded without mode change");
                None
            }
        }
    }

    /// Clear a degradation source; leaves `Degraded` once none remain.
    pub fn recover(&self, source: &str) -> Option<Transition> {
        let mut inner = self.lock();
        if !inner.degraded_by.remove(source) {
            return None;
        }
        if !inner.degraded_by.is_empty() || inner.machine.mode() != RobotMode::Degraded {
            return None;
        }
        let ctx = TransitionContext::new(format!("{source} recovered"));
        self.apply_locked(&mut inner, ModeEvent::HealthRecovered, &ctx)
            .ok()
            .flatten()
    }

    pub fn degradation_sources(&self) -> Vec<String> {
        self.lock().degraded_by.iter().cloned().collect()
    }

    fn apply_locked(
        &self,
        inner: &mut Inner,
        event: ModeEvent,
        ctx: &TransitionContext,
    ) -> Result<Option<Transition>, TransitionError> {
        let applied = inner.machine.apply(event, ctx)?;
        if let Some(t) = &applied {
            self.snapshot.send_replace(inner.machine.state());
            self.bus.publish(Event::at(
                STATE_SOURCE,
                EventPayload::ModeChanged {
                    from: t.from,
                    to: t.to,
                    trigger: t.event,
                    reason: t.reason.clone(),
                },
                t.at,
            ));
            let to = t.to.to_string();
            self.metrics
                .incr("conductor_mode_transitions_total", &[("to", to.as_str())]);
        }
        Ok(applied)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
