//! `conductor-types` – shared data model for the Conductor workspace.
//!
//! Every other crate speaks in these types: module descriptors, robot state,
//! sensor samples, fused frames, health records, metric samples, the event
//! envelope that flows over the bus, and the error taxonomy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Action name every motion-capable module must honour on emergency stop.
pub const EMERGENCY_STOP_ACTION: &str = "emergency_stop";

/// Action name that ends an in-flight motion (`Moving` → `Active`).
pub const STOP_ACTION: &str = "stop";

// ────────────────────────────────────────────────────────────────────────────
// Time
// ────────────────────────────────────────────────────────────────────────────

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic time in nanoseconds since the process clock epoch.
///
/// All window, deadline and staleness arithmetic uses `MonoTime`; wall-clock
/// time is carried alongside only for external observers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MonoTime(u64);

impl MonoTime {
    pub const ZERO: MonoTime = MonoTime(0);

    /// Current monotonic time.  The epoch is fixed on first use.
    pub fn now() -> Self {
        let epoch = CLOCK_EPOCH.get_or_init(Instant::now);
        Self(u64::try_from(epoch.elapsed().as_nanos()).unwrap_or(u64::MAX))
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(duration_nanos(d)))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(duration_nanos(d)))
    }

    /// Elapsed time since `earlier`, or zero when `earlier` is in the future.
    pub fn duration_since(self, earlier: MonoTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Monotonic + wall-clock timestamp pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timestamp {
    pub mono: MonoTime,
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            mono: MonoTime::now(),
            wall: Utc::now(),
        }
    }

    /// A timestamp at a specific monotonic instant, stamped with the current
    /// wall clock.
    pub fn at(mono: MonoTime) -> Self {
        Self {
            mono,
            wall: Utc::now(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Modules
// ────────────────────────────────────────────────────────────────────────────

/// Capability tag carried by a module; also the category of a command.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Motion,
    Audio,
    Video,
    Led,
    Sensing,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Motion => "motion",
            Capability::Audio => "audio",
            Capability::Video => "video",
            Capability::Led => "led",
            Capability::Sensing => "sensing",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Uninitialized,
    Initializing,
    Running,
    Degraded,
    Stopped,
    Failed,
}

impl ModuleStatus {
    /// `true` when the module accepts commands.
    pub fn is_operational(self) -> bool {
        matches!(self, ModuleStatus::Running | ModuleStatus::Degraded)
    }
}

/// Registration record for a hardware module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub id: String,
    pub capabilities: BTreeSet<Capability>,
    pub status: ModuleStatus,
    /// Ids of modules that must be `Running` before this one may start.
    pub dependencies: BTreeSet<String>,
}

impl ModuleDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: BTreeSet::new(),
            status: ModuleStatus::Uninitialized,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn depends_on(mut self, module_id: impl Into<String>) -> Self {
        self.dependencies.insert(module_id.into());
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Category used to gate commands addressed to this module: `motion`
    /// when present, otherwise the first capability.
    pub fn primary_category(&self) -> Option<Capability> {
        if self.has_capability(Capability::Motion) {
            Some(Capability::Motion)
        } else {
            self.capabilities.iter().next().copied()
        }
    }
}

/// Marker returned by a successful `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready;

/// Marker returned by a successful `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Running;

/// Marker returned by a successful `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stopped;

// ────────────────────────────────────────────────────────────────────────────
// Commands
// ────────────────────────────────────────────────────────────────────────────

/// A command routed to a single module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub action: String,
    pub parameters: serde_json::Value,
    /// Explicit gating category; falls back to the target module's
    /// [`ModuleDescriptor::primary_category`].
    pub category: Option<Capability>,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            parameters: serde_json::Value::Null,
            category: None,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_category(mut self, category: Capability) -> Self {
        self.category = Some(category);
        self
    }

    pub fn is_stop(&self) -> bool {
        self.action == STOP_ACTION
    }

    /// `stop` or `emergency_stop`: commands that only ever bring motion to rest.
    pub fn is_halt(&self) -> bool {
        self.is_stop() || self.action == EMERGENCY_STOP_ACTION
    }

    /// Numeric parameter lookup; `None` when absent or not a number.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(|v| v.as_f64())
    }
}

/// JSON body accepted by the command endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommandRequest {
    /// Module-specific action name, e.g. `"walk"`, `"say"`, `"set_color"`.
    pub action: String,
    /// Action parameters.  Motion commands use `vx`, `vy`, `vyaw` (m/s, rad/s).
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Optional override of the gating category.
    #[serde(default)]
    pub category: Option<Capability>,
}

impl From<CommandRequest> for Command {
    fn from(req: CommandRequest) -> Self {
        Command {
            id: Uuid::new_v4(),
            action: req.action,
            parameters: req.parameters,
            category: req.category,
        }
    }
}

/// Acknowledgement returned by a module for an accepted command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub command_id: Uuid,
    pub detail: Option<String>,
}

impl Ack {
    pub fn new(command_id: Uuid) -> Self {
        Self {
            command_id,
            detail: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Robot state
// ────────────────────────────────────────────────────────────────────────────

/// Operating mode of the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotMode {
    Idle,
    Standby,
    Active,
    Moving,
    Charging,
    Degraded,
    Emergency,
    Error,
}

impl RobotMode {
    pub const ALL: [RobotMode; 8] = [
        RobotMode::Idle,
        RobotMode::Standby,
        RobotMode::Active,
        RobotMode::Moving,
        RobotMode::Charging,
        RobotMode::Degraded,
        RobotMode::Emergency,
        RobotMode::Error,
    ];
}

impl fmt::Display for RobotMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RobotMode::Idle => "idle",
            RobotMode::Standby => "standby",
            RobotMode::Active => "active",
            RobotMode::Moving => "moving",
            RobotMode::Charging => "charging",
            RobotMode::Degraded => "degraded",
            RobotMode::Emergency => "emergency",
            RobotMode::Error => "error",
        };
        f.write_str(s)
    }
}

/// Events that drive the robot state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeEvent {
    StartRequested,
    Activate,
    Deactivate,
    MotionCommand,
    MotionComplete,
    StopCommand,
    ChargingStarted,
    ChargingComplete,
    CriticalHealthFailure,
    EmergencyStop,
    ModuleFatalError,
    ModuleDegraded,
    HealthRecovered,
    EmergencyReset,
    ErrorReset,
}

impl fmt::Display for ModeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModeEvent::StartRequested => "start_requested",
            ModeEvent::Activate => "activate",
            ModeEvent::Deactivate => "deactivate",
            ModeEvent::MotionCommand => "motion_command",
            ModeEvent::MotionComplete => "motion_complete",
            ModeEvent::StopCommand => "stop_command",
            ModeEvent::ChargingStarted => "charging_started",
            ModeEvent::ChargingComplete => "charging_complete",
            ModeEvent::CriticalHealthFailure => "critical_health_failure",
            ModeEvent::EmergencyStop => "emergency_stop",
            ModeEvent::ModuleFatalError => "module_fatal_error",
            ModeEvent::ModuleDegraded => "module_degraded",
            ModeEvent::HealthRecovered => "health_recovered",
            ModeEvent::EmergencyReset => "emergency_reset",
            ModeEvent::ErrorReset => "error_reset",
        };
        f.write_str(s)
    }
}

/// The authoritative robot operating state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub mode: RobotMode,
    pub entered_at: Timestamp,
    pub reason: String,
}

impl RobotState {
    pub fn initial() -> Self {
        Self {
            mode: RobotMode::Idle,
            entered_at: Timestamp::now(),
            reason: "boot".to_string(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensors & fusion
// ────────────────────────────────────────────────────────────────────────────

/// Quality flag attached to every sample by the producing module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleQuality {
    Good,
    Degraded,
    Invalid,
}

/// A sample value: numeric vector or structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Vector(Vec<f64>),
    Structured(serde_json::Value),
}

/// One timestamped reading produced by a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub sensor_id: String,
    pub sensor_type: String,
    /// Module that produced the sample.
    pub module_id: String,
    pub value: SensorValue,
    pub timestamp: Timestamp,
    pub quality: SampleQuality,
}

impl SensorSample {
    pub fn new(
        module_id: impl Into<String>,
        sensor_id: impl Into<String>,
        sensor_type: impl Into<String>,
        value: SensorValue,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type: sensor_type.into(),
            module_id: module_id.into(),
            value,
            timestamp: Timestamp::now(),
            quality: SampleQuality::Good,
        }
    }

    pub fn with_quality(mut self, quality: SampleQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn at(mut self, mono: MonoTime) -> Self {
        self.timestamp = Timestamp::at(mono);
        self
    }
}

/// One fixed-duration window of merged telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedFrame {
    pub sequence: u64,
    pub window_start: MonoTime,
    pub window_end: MonoTime,
    /// Best sample per sensor type; `None` marks an expected type that was
    /// absent from the window.
    pub samples_by_type: BTreeMap<String, Option<SensorSample>>,
    pub completeness: f64,
    pub confidence: f64,
}

impl FusedFrame {
    pub fn sample(&self, sensor_type: &str) -> Option<&SensorSample> {
        self.samples_by_type.get(sensor_type).and_then(Option::as_ref)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Health
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unresponsive,
}

/// Liveness record kept per module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub module_id: String,
    pub last_heartbeat_at: Option<Timestamp>,
    pub consecutive_missed_heartbeats: u32,
    pub status: HealthStatus,
}

impl HealthRecord {
    pub fn healthy(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            last_heartbeat_at: Some(Timestamp::now()),
            consecutive_missed_heartbeats: 0,
            status: HealthStatus::Healthy,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Metrics
// ────────────────────────────────────────────────────────────────────────────

/// A single observation handed to the metrics collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    pub timestamp: Timestamp,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            tags: BTreeMap::new(),
            timestamp: Timestamp::now(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, mono: MonoTime) -> Self {
        self.timestamp = Timestamp::at(mono);
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Events
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Telemetry,
    Health,
    Error,
}

/// Kind-specific event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Command(Command),
    Sample(SensorSample),
    Frame(FusedFrame),
    /// The module finished the motion it was executing.
    MotionComplete,
    Heartbeat,
    ModeChanged {
        from: RobotMode,
        to: RobotMode,
        trigger: ModeEvent,
        reason: String,
    },
    ModuleStatusChanged {
        status: ModuleStatus,
    },
    HealthChanged {
        status: HealthStatus,
        missed_heartbeats: u32,
    },
    Fault {
        code: u32,
        message: String,
        fatal: bool,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Command(_) => EventKind::Command,
            EventPayload::Sample(_) | EventPayload::Frame(_) | EventPayload::MotionComplete => {
                EventKind::Telemetry
            }
            EventPayload::Heartbeat
            | EventPayload::ModeChanged { .. }
            | EventPayload::ModuleStatusChanged { .. }
            | EventPayload::HealthChanged { .. } => EventKind::Health,
            EventPayload::Fault { .. } => EventKind::Error,
        }
    }
}

/// Immutable envelope for everything that flows over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    /// e.g. `"motion"`, or `"conductor::state"` for system-originated events.
    pub source_module_id: String,
    pub payload: EventPayload,
    pub timestamp: Timestamp,
}

impl Event {
    pub fn new(source_module_id: impl Into<String>, payload: EventPayload) -> Self {
        Self::at(source_module_id, payload, Timestamp::now())
    }

    pub fn at(
        source_module_id: impl Into<String>,
        payload: EventPayload,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: payload.kind(),
            source_module_id: source_module_id.into(),
            payload,
            timestamp,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InitError {
    #[error("module '{module_id}' failed to initialise: {reason}")]
    Failed { module_id: String, reason: String },

    #[error("module '{module_id}' initialisation timed out after {timeout_ms} ms")]
    Timeout { module_id: String, timeout_ms: u64 },

    #[error("invalid configuration for module '{module_id}': {reason}")]
    InvalidConfig { module_id: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StartError {
    #[error("module '{module_id}' failed to start: {reason}")]
    Failed { module_id: String, reason: String },

    #[error("module '{module_id}' start timed out after {timeout_ms} ms")]
    Timeout { module_id: String, timeout_ms: u64 },

    #[error("module '{module_id}' was started before being initialised")]
    NotInitialized { module_id: String },
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopError {
    #[error("module '{module_id}' failed to stop: {reason}")]
    Failed { module_id: String, reason: String },

    #[error("module '{module_id}' did not stop within {timeout_ms} ms")]
    Timeout { module_id: String, timeout_ms: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandError {
    #[error("module '{module_id}' did not answer within {timeout_ms} ms")]
    Timeout { module_id: String, timeout_ms: u64 },

    #[error("command rejected in mode {mode}: {reason}")]
    Rejected { mode: RobotMode, reason: String },

    #[error("invalid command: {0}")]
    Invalid(String),

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("module '{module_id}' is not accepting commands (status {status:?})")]
    Unavailable {
        module_id: String,
        status: ModuleStatus,
    },

    #[error("module '{module_id}' failed to execute command: {reason}")]
    Failed { module_id: String, reason: String },
}

/// Registration failures.  Both are fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryError {
    #[error("module '{0}' is already registered")]
    DuplicateModule(String),

    #[error("dependency cycle detected: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },
}

/// Returned by `start_all` when not every module reached `Running`.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("partial startup: failed {failed:?}, not started {unstarted:?}")]
pub struct PartialStartupError {
    /// Modules never attempted because a dependency was not `Running`.
    pub unstarted: Vec<String>,
    /// Modules whose `initialize` or `start` failed.
    pub failed: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransitionError {
    #[error("no transition for '{event}' from mode {from}")]
    Illegal { from: RobotMode, event: ModeEvent },

    #[error("transition '{event}' from mode {from} refused: {reason}")]
    GuardFailed {
        from: RobotMode,
        event: ModeEvent,
        reason: String,
    },
}

/// Process-boundary error spanning registration, startup, transport and
/// configuration failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConductorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Startup(#[from] PartialStartupError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),
}
