//! `conductor-perception` – Sensor Fusion layer.
//!
//! Turns asynchronous, heterogeneously-timed sensor streams into one
//! consistent, time-windowed picture of the robot.
//!
//! # Modules
//!
//! - [`fusion`] – [`FusionEngine`][fusion::FusionEngine]: fixed-window,
//!   last-value-wins fusion into [`FusedFrame`][conductor_types::FusedFrame]s
//!   with completeness/confidence scoring and low-confidence detection.

pub mod fusion;

pub use fusion::{FusionConfig, FusionEngine, FusionOutput, FusionStats};
