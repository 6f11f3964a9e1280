//! The module contract.
//!
//! The orchestrator never talks to a vendor SDK directly.  Each hardware
//! subsystem is wrapped in a [`HardwareModule`] and driven exclusively through
//! this trait; everything the module produces flows back as a typed stream of
//! [`EventPayload`] values.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use conductor_types::{
    Ack, Command, CommandError, EventPayload, HealthRecord, InitError, Ready, Running, StartError,
    StopError, Stopped,
};

/// Configuration handed to [`HardwareModule::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub module_id: String,
    /// Module-specific settings, opaque to the orchestrator.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ModuleConfig {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            parameters: serde_json::Value::Null,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Every hardware subsystem must implement this trait.
///
/// # Contract
///
/// * `initialize` / `start` / `stop` – lifecycle.  `stop` must be idempotent:
///   calling it on a stopped module succeeds.
/// * `health_check` – the module's own view of its health.  A `Healthy`
///   report counts as a heartbeat.
/// * `dispatch` – execute one command.  Modules should answer promptly; the
///   orchestrator enforces the command timeout and reports
///   [`CommandError::Timeout`] on the module's behalf.
/// * `telemetry_stream` – live stream of samples, heartbeats, motion
///   completions and faults.  Called once per start; the stream should end
///   after the module stops.
#[async_trait]
pub trait HardwareModule: Send + Sync {
    async fn initialize(&self, config: &ModuleConfig) -> Result<Ready, InitError>;

    async fn start(&self) -> Result<Running, StartError>;

    async fn stop(&self) -> Result<Stopped, StopError>;

    async fn health_check(&self) -> HealthRecord;

    async fn dispatch(&self, command: Command) -> Result<Ack, CommandError>;

    async fn telemetry_stream(&self) -> BoxStream<'static, EventPayload>;
}
