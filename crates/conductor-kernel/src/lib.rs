//! `conductor-kernel` – Safety & Mode Control
//!
//! Pure, synchronous engines that decide what the robot is allowed to do.
//! Nothing in this crate performs I/O or spawns tasks; callers pass explicit
//! [`MonoTime`][conductor_types::MonoTime] values so every decision is
//! reproducible in tests.
//!
//! # Modules
//!
//! - [`state_machine`] – [`StateMachine`][state_machine::StateMachine]:
//!   owns the authoritative [`RobotState`][conductor_types::RobotState] and
//!   applies [`ModeEvent`][conductor_types::ModeEvent]s against a transition
//!   table.  Illegal transitions are rejected, never clamped.
//! - [`command_gate`] – [`CommandGate`][command_gate::CommandGate]:
//!   the single interception point every command passes through before it
//!   reaches a module.  Evaluates mode restrictions and physical safety rules.
//! - [`health_monitor`] – [`HealthMonitor`][health_monitor::HealthMonitor]:
//!   per-module heartbeat tracking with degraded / unresponsive thresholds.
//! - [`restart_policy`] – [`RestartPolicy`][restart_policy::RestartPolicy]:
//!   bounded exponential-backoff restart schedule, parameterised per module.

pub mod command_gate;
pub mod health_monitor;
pub mod restart_policy;
pub mod state_machine;

pub use command_gate::{
    CommandGate, DispatchContext, DispatchRule, ModeRestrictionRule, ModeRule, VelocityCapRule,
};
pub use health_monitor::{HealthAlert, HealthConfig, HealthMonitor};
pub use restart_policy::{RestartDecision, RestartPolicy, RestartTracker};
pub use state_machine::{ExtraTransition, StateMachine, Transition, TransitionContext};
