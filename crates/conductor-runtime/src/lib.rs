//! # conductor-runtime
//!
//! Wires the workspace together into a running middleware.
//!
//! - [`orchestrator`] – [`Orchestrator`]: module lifecycle, command routing,
//!   fusion/health/metrics workers and shutdown.
//! - [`mode`] – [`ModeController`]: the serialising gate around the robot
//!   mode and the command gate.
//! - [`metrics`] – [`MetricsCollector`]: rolling-window aggregation and the
//!   Prometheus text renderer.
//! - [`config`] – [`OrchestratorConfig`].
//! - [`telemetry`] – `tracing` / OpenTelemetry initialisation.

pub mod config;
pub mod metrics;
pub mod mode;
pub mod orchestrator;
pub mod telemetry;

pub use config::OrchestratorConfig;
pub use metrics::{MetricsCollector, MetricsConfig, MetricsSnapshot, SeriesSummary, to_prometheus};
pub use mode::{Admission, ModeController};
pub use orchestrator::{Orchestrator, ShutdownReport, SystemStatus};
pub use telemetry::{LogFormat, LoggingConfig, TracerProviderGuard, init_tracing};
