//! In-process simulated module for CI/CD testing without physical hardware.
//!
//! [`SimModule`] implements [`HardwareModule`] entirely in memory.  It can be
//! scripted to fail initialisation or start, to answer commands slowly, to
//! stop emitting heartbeats, and to publish periodic sensor samples, which is
//! enough to drive the whole orchestrator in headless tests.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use conductor_hal::sim::{SimModule, SimSensor};
//!
//! let imu = SimModule::new("imu_board")
//!     .with_heartbeat(Duration::from_millis(200))
//!     .with_sensor(SimSensor::new("imu", Duration::from_millis(20)));
//! assert_eq!(imu.id(), "imu_board");
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use conductor_types::{
    Ack, Command, CommandError, EventPayload, HealthRecord, HealthStatus,
    InitError, ModuleStatus, Ready, Running, SampleQuality, SensorSample, SensorValue, StartError,
    StopError, Stopped, Timestamp,
};

use crate::module::{HardwareModule, ModuleConfig};

const TELEMETRY_CAPACITY: usize = 256;

// ────────────────────────────────────────────────────────────────────────────
// Sensor script
// ────────────────────────────────────────────────────────────────────────────

/// A periodically sampled simulated sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSensor {
    pub sensor_id: String,
    pub sensor_type: String,
    pub period: Duration,
    pub value: Vec<f64>,
    pub quality: SampleQuality,
}

impl SimSensor {
    /// A sensor whose id equals its type, reporting `[0.0]` with Good quality.
    pub fn new(sensor_type: impl Into<String>, period: Duration) -> Self {
        let sensor_type = sensor_type.into();
        Self {
            sensor_id: sensor_type.clone(),
            sensor_type,
            period,
            value: vec![0.0],
            quality: SampleQuality::Good,
        }
    }

    pub fn with_value(mut self, value: Vec<f64>) -> Self {
        self.value = value;
        self
    }

    pub fn with_quality(mut self, quality: SampleQuality) -> Self {
        self.quality = quality;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimModule
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    fail_init: Option<String>,
    fail_start: Option<String>,
    fail_commands: Option<String>,
    command_delay: Duration,
    stop_delay: Duration,
    heartbeat: Option<Duration>,
    motion_duration: Option<Duration>,
    sensors: Vec<SimSensor>,
}

struct SimState {
    status: ModuleStatus,
    tasks: Vec<JoinHandle<()>>,
    dispatched: Vec<Command>,
}

/// Scriptable in-memory [`HardwareModule`].
pub struct SimModule {
    id: String,
    script: Script,
    state: Mutex<SimState>,
    telemetry: Mutex<broadcast::Sender<EventPayload>>,
    silent: Arc<AtomicBool>,
    init_calls: AtomicU32,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
}

impl SimModule {
    pub fn new(id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(TELEMETRY_CAPACITY);
        Self {
            id: id.into(),
            script: Script::default(),
            state: Mutex::new(SimState {
                status: ModuleStatus::Uninitialized,
                tasks: Vec::new(),
                dispatched: Vec::new(),
            }),
            telemetry: Mutex::new(tx),
            silent: Arc::new(AtomicBool::new(false)),
            init_calls: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ── script builders ─────────────────────────────────────────────────────

    pub fn failing_init(mut self, reason: impl Into<String>) -> Self {
        self.script.fail_init = Some(reason.into());
        self
    }

    pub fn failing_start(mut self, reason: impl Into<String>) -> Self {
        self.script.fail_start = Some(reason.into());
        self
    }

    pub fn failing_commands(mut self, reason: impl Into<String>) -> Self {
        self.script.fail_commands = Some(reason.into());
        self
    }

    /// Every command takes `delay` before it is acknowledged.
    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.script.command_delay = delay;
        self
    }

    pub fn with_stop_delay(mut self, delay: Duration) -> Self {
        self.script.stop_delay = delay;
        self
    }

    /// Emit a `Heartbeat` every `period` while running.
    pub fn with_heartbeat(mut self, period: Duration) -> Self {
        self.script.heartbeat = Some(period);
        self
    }

    /// Emit `MotionComplete` this long after each accepted motion command.
    pub fn with_motion_duration(mut self, duration: Duration) -> Self {
        self.script.motion_duration = Some(duration);
        self
    }

    pub fn with_sensor(mut self, sensor: SimSensor) -> Self {
        self.script.sensors.push(sensor);
        self
    }

    // ── runtime controls ────────────────────────────────────────────────────

    /// Stop (or resume) heartbeats and report unhealthy from `health_check`,
    /// as a hung driver would.  Cleared by the next `start`.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Push an arbitrary payload onto the telemetry stream.
    pub fn inject(&self, payload: EventPayload) -> usize {
        self.sender().send(payload).unwrap_or(0)
    }

    /// Build a sample attributed to this module.
    pub fn sample(&self, sensor_type: &str, value: Vec<f64>) -> SensorSample {
        SensorSample::new(&self.id, sensor_type, sensor_type, SensorValue::Vector(value))
    }

    pub fn status(&self) -> ModuleStatus {
        self.lock().status
    }

    pub fn dispatched(&self) -> Vec<Command> {
        self.lock().dispatched.clone()
    }

    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sender(&self) -> broadcast::Sender<EventPayload> {
        self.telemetry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn spawn_emitters(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        let tx = self.sender();

        if let Some(period) = self.script.heartbeat {
            let tx = tx.clone();
            let silent = Arc::clone(&self.silent);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    if !silent.load(Ordering::SeqCst) {
                        let _ = tx.send(EventPayload::Heartbeat);
                    }
                }
            }));
        }

        for sensor in self.script.sensors.clone() {
            let tx = tx.clone();
            let silent = Arc::clone(&self.silent);
            let module_id = self.id.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sensor.period);
                loop {
                    ticker.tick().await;
                    if silent.load(Ordering::SeqCst) {
                        continue;
                    }
                    let sample = SensorSample {
                        sensor_id: sensor.sensor_id.clone(),
                        sensor_type: sensor.sensor_type.clone(),
                        module_id: module_id.clone(),
                        value: SensorValue::Vector(sensor.value.clone()),
                        timestamp: Timestamp::now(),
                        quality: sensor.quality,
                    };
                    let _ = tx.send(EventPayload::Sample(sample));
                }
            }));
        }
        tasks
    }
}

#[async_trait]
impl HardwareModule for SimModule {
    async fn initialize(&self, config: &ModuleConfig) -> Result<Ready, InitError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.script.fail_init {
            self.lock().status = ModuleStatus::Failed;
            return Err(InitError::Failed {
                module_id: self.id.clone(),
                reason: reason.clone(),
            });
        }
        debug!(module = %self.id, parameters = %config.parameters, "sim module initialised");
        self.lock().status = ModuleStatus::Initializing;
        Ok(Ready)
    }

    async fn start(&self) -> Result<Running, StartError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.lock().status != ModuleStatus::Initializing {
            return Err(StartError::NotInitialized {
                module_id: self.id.clone(),
            });
        }
        if let Some(reason) = &self.script.fail_start {
            self.lock().status = ModuleStatus::Failed;
            return Err(StartError::Failed {
                module_id: self.id.clone(),
                reason: reason.clone(),
            });
        }
        self.silent.store(false, Ordering::SeqCst);
        let tasks = self.spawn_emitters();
        let mut state = self.lock();
        state.tasks = tasks;
        state.status = ModuleStatus::Running;
        Ok(Running)
    }

    async fn stop(&self) -> Result<Stopped, StopError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if !self.script.stop_delay.is_zero() {
            tokio::time::sleep(self.script.stop_delay).await;
        }
        let tasks = std::mem::take(&mut self.lock().tasks);
        for task in tasks {
            task.abort();
        }
        // Replacing the sender closes every open telemetry stream.
        let (fresh, _) = broadcast::channel(TELEMETRY_CAPACITY);
        *self.telemetry.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
        self.lock().status = ModuleStatus::Stopped;
        Ok(Stopped)
    }

    async fn health_check(&self) -> HealthRecord {
        let mut record = HealthRecord::healthy(&self.id);
        if self.silent.load(Ordering::SeqCst) || self.status() != ModuleStatus::Running {
            record.status = HealthStatus::Unresponsive;
            record.last_heartbeat_at = None;
        }
        record
    }

    async fn dispatch(&self, command: Command) -> Result<Ack, CommandError> {
        self.lock().dispatched.push(command.clone());
        if !self.script.command_delay.is_zero() {
            tokio::time::sleep(self.script.command_delay).await;
        }
        if let Some(reason) = &self.script.fail_commands {
            return Err(CommandError::Failed {
                module_id: self.id.clone(),
                reason: reason.clone(),
            });
        }

        let ends_motion = command.is_halt();
        if let Some(duration) = self.script.motion_duration.filter(|_| !ends_motion) {
            let tx = self.sender();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let _ = tx.send(EventPayload::MotionComplete);
            });
        }
        Ok(Ack::new(command.id))
    }

    async fn telemetry_stream(&self) -> BoxStream<'static, EventPayload> {
        let rx = self.sender().subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
