//! [`Orchestrator`] – top-level coordinator of every hardware module.
//!
//! The orchestrator owns the module registry, the health monitor, the fusion
//! engine and the metrics collector, and drives all of them from its own
//! workers:
//!
//! | Worker | Cadence | Work |
//! |---|---|---|
//! | one per module | telemetry-driven + `heartbeat_interval / 2` poll | forwards samples to fusion, heartbeats to health, faults to the mode controller |
//! | fusion tick | `fusion.window_ms` | closes fusion windows, publishes [`FusedFrame`]s |
//! | health sweep | `heartbeat_interval / 4` | turns missed heartbeats into alerts |
//! | metrics | `metrics.aggregate_interval_ms` | folds queued samples into rolling windows |
//!
//! Lifecycle:
//!
//! - [`start_all`](Orchestrator::start_all) starts modules level by level in
//!   dependency order.  A failed module does not roll anything back; its
//!   dependents stay `Uninitialized` and are reported in
//!   [`PartialStartupError`].
//! - [`dispatch`](Orchestrator::dispatch) gates the command through the
//!   [`ModeController`] and forwards it under the command timeout.  A timeout
//!   marks the module `Degraded`.
//! - [`shutdown`](Orchestrator::shutdown) stops modules in reverse dependency
//!   order, giving each one `shutdown_grace_ms`.  Modules that overrun are
//!   recorded as `Failed`, never waited on.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conductor_hal::SimModule;
//! use conductor_runtime::{Orchestrator, OrchestratorConfig};
//! use conductor_types::{Capability, Command, ModuleDescriptor};
//!
//! # async fn demo() {
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default());
//! orchestrator
//!     .register(
//!         ModuleDescriptor::new("led").with_capability(Capability::Led),
//!         Arc::new(SimModule::new("led")),
//!     )
//!     .unwrap();
//! orchestrator.start_all().await.unwrap();
//! orchestrator.dispatch("led", Command::new("blink")).await.unwrap();
//! orchestrator.shutdown().await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use conductor_hal::{HardwareModule, ModuleConfig, ModuleRegistry};
use conductor_kernel::{
    HealthAlert, HealthMonitor, RestartDecision, RestartTracker, Transition,
};
use conductor_middleware::EventBus;
use conductor_perception::{FusionEngine, FusionOutput, FusionStats};
use conductor_types::{
    Ack, Capability, Command, CommandError, EMERGENCY_STOP_ACTION, Event, EventPayload, FusedFrame,
    HealthRecord, HealthStatus, InitError, ModeEvent, ModuleDescriptor, ModuleStatus, MonoTime,
    PartialStartupError, RegistryError, RobotMode, RobotState, StartError, StopError,
    TransitionError,
};
use futures_util::StreamExt;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::metrics::{MetricsCollector, MetricsSnapshot, to_prometheus};
use crate::mode::{Admission, ModeController};

/// Source id of orchestrator-originated events.
pub const SYSTEM_SOURCE: &str = "conductor";
/// Source id of fused frames, and the degradation source fusion reports under.
pub const FUSION_SOURCE: &str = "conductor::fusion";

/// Fault code published when a module stops answering heartbeats.
pub const FAULT_UNRESPONSIVE: u32 = 1001;
/// Fault code published on every emergency stop.
pub const FAULT_EMERGENCY_STOP: u32 = 1002;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(5);

// ────────────────────────────────────────────────────────────────────────────
// Reports
// ────────────────────────────────────────────────────────────────────────────

/// Point-in-time view served to external observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub state: RobotState,
    pub modules: Vec<ModuleDescriptor>,
    pub health: Vec<HealthRecord>,
    /// Confidence of the latest fused frame, if one was produced yet.
    pub fusion_confidence: Option<f64>,
    pub fusion_completeness: Option<f64>,
    pub fusion: FusionStats,
    pub degradation_sources: Vec<String>,
    pub history: Vec<Transition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    /// Modules whose `stop` failed or overran the grace period.
    pub failed: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ────────────────────────────────────────────────────────────────────────────

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Shared {
    config: OrchestratorConfig,
    registry: RwLock<ModuleRegistry>,
    health: Mutex<HealthMonitor>,
    fusion: Mutex<FusionEngine>,
    restarts: Mutex<RestartTracker>,
    mode: ModeController,
    metrics: Arc<MetricsCollector>,
    bus: EventBus,
    frames: watch::Sender<Option<FusedFrame>>,
    shutdown: watch::Sender<bool>,
    system_tasks: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<HashMap<String, Worker>>,
    /// Module blamed by the last fusion degradation report.
    fusion_blamed: Mutex<Option<String>>,
    shutdown_report: tokio::sync::Mutex<Option<ShutdownReport>>,
    system_started: AtomicBool,
    shutting_down: AtomicBool,
}

/// Cheap to clone; every clone drives the same modules.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let bus = EventBus::new(config.bus_capacity);
        let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));
        let mode = ModeController::new(&config, bus.clone(), Arc::clone(&metrics));
        let (frames, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                registry: RwLock::new(ModuleRegistry::new()),
                health: Mutex::new(HealthMonitor::new(config.health.clone())),
                fusion: Mutex::new(FusionEngine::new(config.fusion.clone(), MonoTime::now())),
                restarts: Mutex::new(RestartTracker::new()),
                mode,
                metrics,
                bus,
                frames,
                shutdown,
                system_tasks: Mutex::new(Vec::new()),
                workers: Mutex::new(HashMap::new()),
                fusion_blamed: Mutex::new(None),
                shutdown_report: tokio::sync::Mutex::new(None),
                system_started: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                config,
            }),
        }
    }

    // ── registration ────────────────────────────────────────────────────────

    /// Register a module with an empty configuration.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateModule`] or [`RegistryError::DependencyCycle`].
    pub fn register(
        &self,
        descriptor: ModuleDescriptor,
        module: Arc<dyn HardwareModule>,
    ) -> Result<(), RegistryError> {
        let config = ModuleConfig::new(descriptor.id.clone());
        self.register_with_config(descriptor, module, config)
    }

    pub fn register_with_config(
        &self,
        mut descriptor: ModuleDescriptor,
        module: Arc<dyn HardwareModule>,
        config: ModuleConfig,
    ) -> Result<(), RegistryError> {
        descriptor.status = ModuleStatus::Uninitialized;
        self.registry_write().register(descriptor, module, config)
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Start every registered module in dependency order.
    ///
    /// Modules in the same level start concurrently.  A module is started only
    /// once all of its dependencies are `Running`; anything else is left
    /// `Uninitialized` and listed in [`PartialStartupError::unstarted`].
    /// Modules already running are skipped, so calling this again after
    /// registering more modules starts only the new ones.
    ///
    /// # Errors
    ///
    /// [`PartialStartupError`] when at least one module failed or was left
    /// unstarted.  Every module that did start keeps running.
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> Result<(), PartialStartupError> {
        self.spawn_system_workers();
        let plan = self.registry_read().plan();

        let mut unstarted = Vec::new();
        let mut failed = Vec::new();
        for level in &plan.levels {
            let mut launch = Vec::new();
            {
                let registry = self.registry_read();
                for id in level {
                    let Some(entry) = registry.get(id) else {
                        continue;
                    };
                    if entry.descriptor.status.is_operational() {
                        continue;
                    }
                    let deps_running = entry
                        .descriptor
                        .dependencies
                        .iter()
                        .all(|dep| registry.status(dep) == Some(ModuleStatus::Running));
                    if deps_running {
                        launch.push(id.clone());
                    } else {
                        info!(module = %id, "dependencies not running; module left unstarted");
                        unstarted.push(id.clone());
                    }
                }
            }

            let results = join_all(launch.iter().map(|id| self.start_module(id))).await;
            for (id, result) in launch.into_iter().zip(results) {
                if result.is_err() {
                    failed.push(id);
                }
            }
        }
        for id in plan.blocked {
            warn!(module = %id, "module depends on an unregistered module");
            unstarted.push(id);
        }

        if self.shared.mode.mode() == RobotMode::Idle {
            let healthy = self.all_healthy();
            if let Err(e) = self
                .shared
                .mode
                .apply(ModeEvent::StartRequested, "modules started", healthy)
            {
                warn!(error = %e, "could not leave idle after startup");
            }
        }

        if unstarted.is_empty() && failed.is_empty() {
            info!("all modules running");
            Ok(())
        } else {
            let err = PartialStartupError { unstarted, failed };
            warn!(error = %err, "partial startup");
            Err(err)
        }
    }

    /// Stop every module in reverse dependency order.
    ///
    /// Stop failures and grace-period overruns are logged and the module is
    /// recorded as `Failed`; shutdown itself always completes.  Calling it
    /// again returns the first report.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut done = self.shared.shutdown_report.lock().await;
        if let Some(report) = done.as_ref() {
            return report.clone();
        }
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let grace = self.shared.config.shutdown_grace();

        self.shared.shutdown.send_replace(true);
        let system_tasks = std::mem::take(&mut *lock(&self.shared.system_tasks));
        for mut task in system_tasks {
            if time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }

        let mut report = ShutdownReport::default();
        let levels = self.registry_read().stop_order();
        for level in levels {
            let targets: Vec<(String, Arc<dyn HardwareModule>)> = {
                let registry = self.registry_read();
                level
                    .into_iter()
                    .filter_map(|id| {
                        let entry = registry.get(&id)?;
                        match entry.descriptor.status {
                            ModuleStatus::Uninitialized | ModuleStatus::Stopped => None,
                            _ => Some((id, Arc::clone(&entry.module))),
                        }
                    })
                    .collect()
            };
            let results = join_all(
                targets
                    .iter()
                    .map(|(id, module)| self.stop_module(id, Arc::clone(module))),
            )
            .await;
            for ((id, _), stopped) in targets.into_iter().zip(results) {
                if stopped {
                    report.stopped.push(id);
                } else {
                    report.failed.push(id);
                }
            }
        }

        info!(stopped = ?report.stopped, failed = ?report.failed, "shutdown complete");
        *done = Some(report.clone());
        report
    }

    // ── commands ────────────────────────────────────────────────────────────

    /// Route `command` to `module_id`.
    ///
    /// The command category is `command.category`, or the module's primary
    /// capability.  It must be permitted in the current mode.  The module
    /// gets `command_timeout_ms` to answer.
    ///
    /// # Errors
    ///
    /// - [`CommandError::UnknownModule`] / [`CommandError::Unavailable`]
    /// - [`CommandError::Rejected`] – not permitted in the current mode.
    /// - [`CommandError::Invalid`] – a safety rule refused the parameters.
    /// - [`CommandError::Timeout`] – the module did not answer in time; it is
    ///   marked `Degraded`.
    /// - whatever the module itself returned.
    #[instrument(skip(self, command), fields(action = %command.action, command_id = %command.id))]
    pub async fn dispatch(&self, module_id: &str, command: Command) -> Result<Ack, CommandError> {
        let started = Instant::now();
        let result = self.route(module_id, command).await;

        let outcome = match &result {
            Ok(_) => "accepted",
            Err(CommandError::Rejected { .. }) => "rejected",
            Err(CommandError::Timeout { .. }) => "timeout",
            Err(CommandError::Invalid(_)) => "invalid",
            Err(_) => "failed",
        };
        let metrics = &self.shared.metrics;
        metrics.incr(
            "conductor_commands_total",
            &[("module", module_id), ("outcome", outcome)],
        );
        metrics.observe(
            "conductor_command_latency_ms",
            started.elapsed().as_secs_f64() * 1_000.0,
            &[("module", module_id)],
        );
        result
    }

    async fn route(&self, module_id: &str, command: Command) -> Result<Ack, CommandError> {
        let (module, descriptor) = {
            let registry = self.registry_read();
            let entry = registry
                .get(module_id)
                .ok_or_else(|| CommandError::UnknownModule(module_id.to_string()))?;
            (Arc::clone(&entry.module), entry.descriptor.clone())
        };
        if !descriptor.status.is_operational() {
            return Err(CommandError::Unavailable {
                module_id: module_id.to_string(),
                status: descriptor.status,
            });
        }

        let category = command.category.or_else(|| descriptor.primary_category());
        let admission = self.shared.mode.admit(module_id, category, &command)?;
        self.shared
            .bus
            .publish(Event::new(module_id, EventPayload::Command(command.clone())));

        let timeout = self.shared.config.command_timeout();
        match time::timeout(timeout, module.dispatch(command)).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(e)) => {
                warn!(module = module_id, error = %e, "command failed");
                if admission == Admission::StartedMotion {
                    self.revert_motion(module_id);
                }
                Err(e)
            }
            Err(_) => {
                warn!(module = module_id, ?timeout, "command timed out");
                let alert = lock(&self.shared.health).mark_degraded(module_id, "command timeout");
                if let Some(alert) = alert {
                    self.handle_alert(alert);
                }
                if admission == Admission::StartedMotion {
                    self.revert_motion(module_id);
                }
                Err(CommandError::Timeout {
                    module_id: module_id.to_string(),
                    timeout_ms: self.shared.config.command_timeout_ms,
                })
            }
        }
    }

    /// End a motion that never got under way.  While `Degraded` this only
    /// marks the motion as ended, so recovery returns to `Active`.
    fn revert_motion(&self, module_id: &str) {
        if !matches!(
            self.shared.mode.mode(),
            RobotMode::Moving | RobotMode::Degraded
        ) {
            return;
        }
        let reason = format!("motion command to {module_id} failed");
        if let Err(e) = self.shared.mode.apply(ModeEvent::StopCommand, &reason, true) {
            debug!(error = %e, "motion revert skipped");
        }
    }

    /// Force `Emergency` and send an emergency stop to every operational
    /// motion module.  Always accepted; fan-out failures are only logged.
    #[instrument(skip(self))]
    pub async fn emergency_stop(&self, reason: &str) -> RobotState {
        let healthy = self.all_healthy();
        if let Err(e) = self.shared.mode.apply(ModeEvent::EmergencyStop, reason, healthy) {
            error!(error = %e, "emergency stop transition refused");
        }
        self.shared.bus.publish(Event::new(
            SYSTEM_SOURCE,
            EventPayload::Fault {
                code: FAULT_EMERGENCY_STOP,
                message: format!("emergency stop: {reason}"),
                fatal: false,
            },
        ));

        let targets: Vec<(String, Arc<dyn HardwareModule>)> = self
            .registry_read()
            .iter()
            .filter(|e| {
                e.descriptor.has_capability(Capability::Motion)
                    && e.descriptor.status.is_operational()
            })
            .map(|e| (e.descriptor.id.clone(), Arc::clone(&e.module)))
            .collect();

        let timeout = self.shared.config.command_timeout();
        let results = join_all(targets.iter().map(|(_, module)| {
            let command = Command::new(EMERGENCY_STOP_ACTION).with_category(Capability::Motion);
            time::timeout(timeout, module.dispatch(command))
        }))
        .await;
        for ((id, _), result) in targets.iter().zip(results) {
            match result {
                Ok(Ok(_)) => info!(module = %id, "emergency stop delivered"),
                Ok(Err(e)) => error!(module = %id, error = %e, "emergency stop failed"),
                Err(_) => error!(module = %id, ?timeout, "emergency stop timed out"),
            }
        }
        self.shared.mode.state()
    }

    /// Apply an operator-requested mode event (`activate`, `error_reset`, ...).
    pub fn apply_mode_event(
        &self,
        event: ModeEvent,
        reason: &str,
    ) -> Result<RobotState, TransitionError> {
        let healthy = self.all_healthy();
        self.shared.mode.apply(event, reason, healthy)?;
        Ok(self.shared.mode.state())
    }

    // ── observation ─────────────────────────────────────────────────────────

    pub fn mode(&self) -> RobotMode {
        self.shared.mode.mode()
    }

    pub fn state(&self) -> RobotState {
        self.shared.mode.state()
    }

    pub fn module_status(&self, module_id: &str) -> Option<ModuleStatus> {
        self.registry_read().status(module_id)
    }

    pub fn health_record(&self, module_id: &str) -> Option<HealthRecord> {
        lock(&self.shared.health).record(module_id)
    }

    pub fn latest_frame(&self) -> Option<FusedFrame> {
        self.shared.frames.borrow().clone()
    }

    pub fn last_known_good(&self) -> Option<FusedFrame> {
        lock(&self.shared.fusion).last_known_good().cloned()
    }

    /// Each part is snapshotted under its own lock; no two are held at once.
    pub fn status(&self) -> SystemStatus {
        let latest = self.shared.frames.borrow().clone();
        let state = self.shared.mode.state();
        let modules = self.registry_read().descriptors();
        let health = lock(&self.shared.health).records();
        let fusion = lock(&self.shared.fusion).stats();
        SystemStatus {
            state,
            modules,
            health,
            fusion_confidence: latest.as_ref().map(|f| f.confidence),
            fusion_completeness: latest.as_ref().map(|f| f.completeness),
            fusion,
            degradation_sources: self.shared.mode.degradation_sources(),
            history: self.shared.mode.history(),
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot(MonoTime::now())
    }

    /// Metrics snapshot in the Prometheus text exposition format.
    pub fn prometheus(&self) -> String {
        to_prometheus(&self.metrics_snapshot())
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.shared.metrics
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Receives every fused frame as it is produced.
    pub fn subscribe_frames(&self) -> watch::Receiver<Option<FusedFrame>> {
        self.shared.frames.subscribe()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<RobotState> {
        self.shared.mode.subscribe()
    }

    // ── module lifecycle internals ──────────────────────────────────────────

    async fn start_module(&self, id: &str) -> Result<(), String> {
        let (module, config) = {
            let registry = self.registry_read();
            let entry = registry
                .get(id)
                .ok_or_else(|| format!("module '{id}' is not registered"))?;
            (Arc::clone(&entry.module), entry.config.clone())
        };
        self.set_status(id, ModuleStatus::Initializing);

        let timeout = self.shared.config.startup_timeout();
        let timeout_ms = self.shared.config.startup_timeout_ms;
        let outcome: Result<(), String> = async {
            match time::timeout(timeout, module.initialize(&config)).await {
                Ok(Ok(_ready)) => {}
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => {
                    let e = InitError::Timeout {
                        module_id: id.to_string(),
                        timeout_ms,
                    };
                    return Err(e.to_string());
                }
            }
            match time::timeout(timeout, module.start()).await {
                Ok(Ok(_running)) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(StartError::Timeout {
                    module_id: id.to_string(),
                    timeout_ms,
                }
                .to_string()),
            }
        }
        .await;

        match outcome {
            Ok(()) => {
                lock(&self.shared.health).register(id, MonoTime::now());
                self.set_status(id, ModuleStatus::Running);
                self.spawn_worker(id, module);
                info!(module = id, "module running");
                Ok(())
            }
            Err(reason) => {
                error!(module = id, %reason, "module failed to start");
                self.set_status(id, ModuleStatus::Failed);
                Err(reason)
            }
        }
    }

    /// Stop one module within the grace period; `true` when it stopped cleanly.
    async fn stop_module(&self, id: &str, module: Arc<dyn HardwareModule>) -> bool {
        let grace = self.shared.config.shutdown_grace();
        self.stop_worker(id).await;
        lock(&self.shared.health).unregister(id);

        match time::timeout(grace, module.stop()).await {
            Ok(Ok(_stopped)) => {
                self.set_status(id, ModuleStatus::Stopped);
                info!(module = id, "module stopped");
                true
            }
            Ok(Err(e)) => {
                warn!(module = id, error = %e, "module stop failed");
                self.set_status(id, ModuleStatus::Failed);
                false
            }
            Err(_) => {
                let e = StopError::Timeout {
                    module_id: id.to_string(),
                    timeout_ms: self.shared.config.shutdown_grace_ms,
                };
                warn!(module = id, error = %e, "module overran shutdown grace");
                self.set_status(id, ModuleStatus::Failed);
                false
            }
        }
    }

    fn set_status(&self, id: &str, status: ModuleStatus) {
        let previous = self.registry_write().set_status(id, status);
        if let Some(previous) = previous.filter(|p| *p != status) {
            debug!(module = id, ?previous, ?status, "module status changed");
            self.shared
                .bus
                .publish(Event::new(id, EventPayload::ModuleStatusChanged { status }));
        }
    }

    fn all_healthy(&self) -> bool {
        lock(&self.shared.health).all_healthy()
    }

    // ── module workers ──────────────────────────────────────────────────────

    fn spawn_worker(&self, id: &str, module: Arc<dyn HardwareModule>) {
        let (stop, mut stop_rx) = watch::channel(false);
        let this = self.clone();
        let module_id = id.to_string();
        // Twice per interval, so a steady module never ages past one interval.
        let poll = (self.shared.config.health.heartbeat_interval() / 2).max(MIN_SWEEP_INTERVAL);
        let poll_timeout = self.shared.config.command_timeout();

        let handle = tokio::spawn(async move {
            let mut telemetry = module.telemetry_stream().await;
            let mut telemetry_open = true;
            let mut ticker = time::interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    payload = telemetry.next(), if telemetry_open => match payload {
                        Some(payload) => this.on_telemetry(&module_id, payload),
                        None => {
                            debug!(module = %module_id, "telemetry stream closed");
                            telemetry_open = false;
                        }
                    },
                    _ = ticker.tick() => {
                        let healthy = matches!(
                            time::timeout(poll_timeout, module.health_check()).await,
                            Ok(record) if record.status == HealthStatus::Healthy
                        );
                        if healthy {
                            this.on_heartbeat(&module_id);
                        }
                    }
                }
            }
            debug!(module = %module_id, "module worker exited");
        });

        let previous = lock(&self.shared.workers).insert(id.to_string(), Worker { stop, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    async fn stop_worker(&self, id: &str) {
        let worker = lock(&self.shared.workers).remove(id);
        let Some(Worker { stop, mut handle }) = worker else {
            return;
        };
        stop.send_replace(true);
        if time::timeout(self.shared.config.shutdown_grace(), &mut handle)
            .await
            .is_err()
        {
            warn!(module = id, "module worker did not exit in time");
            handle.abort();
        }
    }

    fn on_telemetry(&self, module_id: &str, payload: EventPayload) {
        match payload {
            EventPayload::Sample(mut sample) => {
                sample.module_id = module_id.to_string();
                let timestamp = sample.timestamp;
                lock(&self.shared.fusion).ingest(sample.clone());
                self.shared
                    .bus
                    .publish(Event::at(module_id, EventPayload::Sample(sample), timestamp));
            }
            EventPayload::Heartbeat => {
                self.on_heartbeat(module_id);
                self.shared
                    .bus
                    .publish(Event::new(module_id, EventPayload::Heartbeat));
            }
            EventPayload::MotionComplete => {
                self.shared
                    .bus
                    .publish(Event::new(module_id, EventPayload::MotionComplete));
                let reason = format!("{module_id} finished motion");
                if let Err(e) = self.shared.mode.apply(ModeEvent::MotionComplete, &reason, true) {
                    debug!(module = module_id, error = %e, "motion completion ignored");
                }
            }
            EventPayload::Fault {
                code,
                message,
                fatal,
            } => {
                self.shared.bus.publish(Event::new(
                    module_id,
                    EventPayload::Fault {
                        code,
                        message: message.clone(),
                        fatal,
                    },
                ));
                if fatal {
                    error!(module = module_id, code, %message, "fatal module fault");
                    self.set_status(module_id, ModuleStatus::Failed);
                    self.module_fatal(module_id, &message);
                } else {
                    warn!(module = module_id, code, %message, "module fault");
                }
            }
            other => {
                self.shared.bus.publish(Event::new(module_id, other));
            }
        }
    }

    fn on_heartbeat(&self, module_id: &str) {
        let alert = lock(&self.shared.health).heartbeat(module_id, MonoTime::now());
        if let Some(alert) = alert {
            self.handle_alert(alert);
        }
    }

    fn module_fatal(&self, module_id: &str, reason: &str) {
        let reason = format!("{module_id}: {reason}");
        if let Err(e) = self
            .shared
            .mode
            .apply(ModeEvent::ModuleFatalError, &reason, false)
        {
            debug!(module = module_id, error = %e, "module fatal error without mode change");
        }
    }

    // ── health ──────────────────────────────────────────────────────────────

    fn handle_alert(&self, alert: HealthAlert) {
        match alert {
            HealthAlert::Degraded { module_id, missed } => {
                if self.module_status(&module_id) == Some(ModuleStatus::Running) {
                    self.set_status(&module_id, ModuleStatus::Degraded);
                }
                self.publish_health(&module_id, HealthStatus::Degraded, missed);
                let reason = format!("{module_id} degraded ({missed} missed heartbeats)");
                self.shared.mode.degrade(&module_id, &reason);
            }
            HealthAlert::Unresponsive { module_id, missed } => {
                if self.module_status(&module_id) == Some(ModuleStatus::Running) {
                    self.set_status(&module_id, ModuleStatus::Degraded);
                }
                self.publish_health(&module_id, HealthStatus::Unresponsive, missed);
                let message = format!("{module_id} unresponsive ({missed} missed heartbeats)");
                self.shared.bus.publish(Event::new(
                    module_id.as_str(),
                    EventPayload::Fault {
                        code: FAULT_UNRESPONSIVE,
                        message: message.clone(),
                        fatal: true,
                    },
                ));
                self.module_fatal(&module_id, "unresponsive");

                let is_motion = self
                    .registry_read()
                    .get(&module_id)
                    .is_some_and(|e| e.descriptor.has_capability(Capability::Motion));
                if is_motion {
                    if let Err(e) =
                        self.shared
                            .mode
                            .apply(ModeEvent::CriticalHealthFailure, &message, false)
                    {
                        debug!(module = %module_id, error = %e, "critical failure without mode change");
                    }
                }

                if self.shared.config.restart_policy_for(&module_id).enabled {
                    let this = self.clone();
                    tokio::spawn(async move { this.restart(&module_id).await });
                }
            }
            HealthAlert::Recovered { module_id } => {
                if self.module_status(&module_id) == Some(ModuleStatus::Degraded) {
                    self.set_status(&module_id, ModuleStatus::Running);
                }
                self.publish_health(&module_id, HealthStatus::Healthy, 0);
                self.shared.mode.recover(&module_id);
            }
        }
    }

    fn publish_health(&self, module_id: &str, status: HealthStatus, missed: u32) {
        self.shared.bus.publish(Event::new(
            module_id,
            EventPayload::HealthChanged {
                status,
                missed_heartbeats: missed,
            },
        ));
    }

    /// Restart an unresponsive module with backoff until it runs again or its
    /// policy gives up.
    #[instrument(skip(self))]
    async fn restart(&self, module_id: &str) {
        let policy = self.shared.config.restart_policy_for(module_id).clone();
        loop {
            if self.shared.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            let decision = lock(&self.shared.restarts).next(module_id, &policy);
            match decision {
                RestartDecision::Retry { attempt, delay } => {
                    info!(module = module_id, attempt, ?delay, "restarting module");
                    let module = self
                        .registry_read()
                        .get(module_id)
                        .map(|e| Arc::clone(&e.module));
                    let Some(module) = module else {
                        return;
                    };
                    self.stop_worker(module_id).await;
                    if let Ok(Err(e)) =
                        time::timeout(self.shared.config.shutdown_grace(), module.stop()).await
                    {
                        debug!(module = module_id, error = %e, "stop before restart failed");
                    }
                    time::sleep(delay).await;
                    if self.shared.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }

                    self.shared
                        .metrics
                        .incr("conductor_module_restarts_total", &[("module", module_id)]);
                    if self.start_module(module_id).await.is_ok() {
                        info!(module = module_id, attempt, "module restarted");
                        self.shared.mode.recover(module_id);
                        return;
                    }
                }
                RestartDecision::GiveUp { attempts } => {
                    error!(module = module_id, attempts, "restart attempts exhausted; module failed");
                    self.stop_worker(module_id).await;
                    lock(&self.shared.health).unregister(module_id);
                    self.set_status(module_id, ModuleStatus::Failed);
                    self.shared.mode.recover(module_id);
                    return;
                }
                RestartDecision::Disabled => return,
            }
        }
    }

    // ── system workers ──────────────────────────────────────────────────────

    fn spawn_system_workers(&self) {
        if self.shared.system_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let order = self.registry_read().ids();
        {
            let mut fusion = lock(&self.shared.fusion);
            *fusion = FusionEngine::new(self.shared.config.fusion.clone(), MonoTime::now());
            fusion.set_module_order(order);
        }

        let config = &self.shared.config;
        let sweep = (config.health.heartbeat_interval() / 4).max(MIN_SWEEP_INTERVAL);
        let tasks = vec![
            self.spawn_periodic("fusion", config.fusion.window(), |o| o.fusion_tick()),
            self.spawn_periodic("health", sweep, |o| o.health_sweep()),
            self.spawn_periodic("metrics", config.metrics.aggregate_interval(), |o| {
                o.shared.metrics.aggregate(MonoTime::now());
            }),
        ];
        lock(&self.shared.system_tasks).extend(tasks);
    }

    fn spawn_periodic<F>(&self, name: &'static str, period: Duration, work: F) -> JoinHandle<()>
    where
        F: Fn(&Orchestrator) + Send + 'static,
    {
        let this = self.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => work(&this),
                }
            }
            debug!(worker = name, "system worker exited");
        })
    }

    fn fusion_tick(&self) {
        // Keep new module ids in the tie-break order.
        let order = self.registry_read().ids();
        let outputs = {
            let mut fusion = lock(&self.shared.fusion);
            fusion.set_module_order(order);
            fusion.tick(MonoTime::now())
        };

        for output in outputs {
            match output {
                FusionOutput::Frame(frame) => {
                    let metrics = &self.shared.metrics;
                    metrics.observe("conductor_fusion_confidence", frame.confidence, &[]);
                    metrics.observe("conductor_fusion_completeness", frame.completeness, &[]);
                    self.shared.frames.send_replace(Some(frame.clone()));
                    self.shared
                        .bus
                        .publish(Event::new(FUSION_SOURCE, EventPayload::Frame(frame)));
                }
                FusionOutput::Degraded {
                    module_id,
                    confidence,
                    frames,
                } => {
                    warn!(module = %module_id, confidence, frames, "fusion confidence low");
                    if self.module_status(&module_id) == Some(ModuleStatus::Running) {
                        self.set_status(&module_id, ModuleStatus::Degraded);
                    }
                    let reason = format!(
                        "fusion confidence {confidence:.2} for {frames} frames; worst module {module_id}"
                    );
                    *lock(&self.shared.fusion_blamed) = Some(module_id);
                    self.shared.mode.degrade(FUSION_SOURCE, &reason);
                }
                FusionOutput::Recovered { confidence } => {
                    info!(confidence, "fusion confidence recovered");
                    let blamed = lock(&self.shared.fusion_blamed).take();
                    if let Some(module_id) = blamed {
                        let healthy = lock(&self.shared.health).status(&module_id)
                            == Some(HealthStatus::Healthy);
                        if healthy && self.module_status(&module_id) == Some(ModuleStatus::Degraded)
                        {
                            self.set_status(&module_id, ModuleStatus::Running);
                        }
                    }
                    self.shared.mode.recover(FUSION_SOURCE);
                }
            }
        }
    }

    fn health_sweep(&self) {
        let alerts = lock(&self.shared.health).sweep(MonoTime::now());
        for alert in alerts {
            self.handle_alert(alert);
        }
    }

    // ── lock helpers ────────────────────────────────────────────────────────

    fn registry_read(&self) -> RwLockReadGuard<'_, ModuleRegistry> {
        self.shared
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn registry_write(&self) -> RwLockWriteGuard<'_, ModuleRegistry> {
        self.shared
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_hal::{SimModule, SimSensor};
    use conductor_kernel::{HealthConfig, RestartPolicy};
    use conductor_middleware::{Topic, TopicReceiver};
    use conductor_perception::FusionConfig;
    use serde_json::json;

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            command_timeout_ms: 100,
            startup_timeout_ms: 500,
            shutdown_grace_ms: 200,
            health: HealthConfig {
                heartbeat_interval_ms: 10_000,
                ..HealthConfig::default()
            },
            ..OrchestratorConfig::default()
        }
    }

    fn add(orch: &Orchestrator, descriptor: ModuleDescriptor, sim: SimModule) -> Arc<SimModule> {
        let sim = Arc::new(sim);
        orch.register(descriptor, sim.clone()).unwrap();
        sim
    }

    fn motion() -> ModuleDescriptor {
        ModuleDescriptor::new("motion").with_capability(Capability::Motion)
    }

    fn led() -> ModuleDescriptor {
        ModuleDescriptor::new("led").with_capability(Capability::Led)
    }

    fn walk() -> Command {
        Command::new("walk").with_parameters(json!({ "vx": 0.2 }))
    }

    async fn drain(rx: &mut TopicReceiver) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(Ok(ev)) = time::timeout(Duration::from_millis(50), rx.recv()).await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn failed_dependency_leaves_dependents_unstarted() {
        let orch = Orchestrator::new(fast_config());
        add(&orch, motion(), SimModule::new("motion").failing_init("encoder fault"));
        let balance = add(
            &orch,
            ModuleDescriptor::new("balance")
                .with_capability(Capability::Sensing)
                .depends_on("motion"),
            SimModule::new("balance"),
        );
        add(&orch, led(), SimModule::new("led"));

        let err = orch.start_all().await.unwrap_err();
        assert_eq!(err.unstarted, vec!["balance".to_string()]);
        assert_eq!(err.failed, vec!["motion".to_string()]);

        assert_eq!(orch.module_status("balance"), Some(ModuleStatus::Uninitialized));
        assert_eq!(orch.module_status("led"), Some(ModuleStatus::Running));
        assert_eq!(orch.module_status("motion"), Some(ModuleStatus::Failed));
        assert_eq!(balance.init_calls(), 0);
        assert_eq!(orch.mode(), RobotMode::Standby);
    }

    #[tokio::test]
    async fn dependencies_start_first() {
        let orch = Orchestrator::new(fast_config());
        add(&orch, motion(), SimModule::new("motion"));
        add(
            &orch,
            ModuleDescriptor::new("balance").depends_on("motion"),
            SimModule::new("balance"),
        );
        orch.start_all().await.unwrap();
        assert_eq!(orch.module_status("balance"), Some(ModuleStatus::Running));
        assert!(orch.health_record("balance").is_some());
    }

    #[tokio::test]
    async fn unknown_dependency_is_reported_unstarted() {
        let orch = Orchestrator::new(fast_config());
        add(
            &orch,
            ModuleDescriptor::new("arm").depends_on("shoulder"),
            SimModule::new("arm"),
        );
        let err = orch.start_all().await.unwrap_err();
        assert_eq!(err.unstarted, vec!["arm".to_string()]);
        assert!(err.failed.is_empty());
    }

    #[tokio::test]
    async fn registration_errors_surface() {
        let orch = Orchestrator::new(fast_config());
        add(&orch, led(), SimModule::new("led"));
        let dup = orch.register(led(), Arc::new(SimModule::new("led")));
        assert_eq!(dup, Err(RegistryError::DuplicateModule("led".into())));

        orch.register(
            ModuleDescriptor::new("a").depends_on("b"),
            Arc::new(SimModule::new("a")),
        )
        .unwrap();
        let cycle = orch.register(
            ModuleDescriptor::new("b").depends_on("a"),
            Arc::new(SimModule::new("b")),
        );
        assert!(matches!(cycle, Err(RegistryError::DependencyCycle { .. })));
    }

    #[tokio::test]
    async fn emergency_stop_blocks_motion() {
        let orch = Orchestrator::new(fast_config());
        let sim = add(&orch, motion(), SimModule::new("motion"));
        orch.start_all().await.unwrap();
        orch.apply_mode_event(ModeEvent::Activate, "operator").unwrap();

        orch.dispatch("motion", walk()).await.unwrap();
        assert_eq!(orch.mode(), RobotMode::Moving);

        let state = orch.emergency_stop("operator button").await;
        assert_eq!(state.mode, RobotMode::Emergency);
        assert!(
            sim.dispatched()
                .iter()
                .any(|c| c.action == EMERGENCY_STOP_ACTION)
        );

        let err = orch.dispatch("motion", walk()).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Rejected {
                mode: RobotMode::Emergency,
                ..
            }
        ));
        // A second emergency stop is still accepted.
        assert_eq!(orch.emergency_stop("again").await.mode, RobotMode::Emergency);
    }

    #[tokio::test]
    async fn emergency_reset_returns_to_standby() {
        let orch = Orchestrator::new(fast_config());
        add(&orch, motion(), SimModule::new("motion"));
        orch.start_all().await.unwrap();
        orch.emergency_stop("test").await;
        let mut watcher = orch.subscribe_mode();
        watcher.borrow_and_update();

        let state = orch
            .apply_mode_event(ModeEvent::EmergencyReset, "all clear")
            .unwrap();
        assert_eq!(state.mode, RobotMode::Standby);
        assert!(watcher.has_changed().unwrap());
        assert_eq!(watcher.borrow().mode, RobotMode::Standby);
    }

    #[tokio::test]
    async fn start_failure_is_reported_failed() {
        let orch = Orchestrator::new(fast_config());
        let audio = add(
            &orch,
            ModuleDescriptor::new("audio").with_capability(Capability::Audio),
            SimModule::new("audio").failing_start("amplifier offline"),
        );
        let err = orch.start_all().await.unwrap_err();
        assert_eq!(err.failed, vec!["audio".to_string()]);
        assert!(err.unstarted.is_empty());
        assert_eq!(audio.init_calls(), 1);
        assert_eq!(orch.module_status("audio"), Some(ModuleStatus::Failed));
    }

    #[tokio::test]
    async fn motion_rejected_outside_active() {
        let orch = Orchestrator::new(fast_config());
        let sim = add(&orch, motion(), SimModule::new("motion"));
        orch.start_all().await.unwrap();
        let err = orch.dispatch("motion", walk()).await.unwrap_err();
        assert!(matches!(err, CommandError::Rejected { mode: RobotMode::Standby, .. }));
        assert!(sim.dispatched().is_empty());

        let snap = orch.metrics_snapshot();
        assert_eq!(
            snap.find(
                "conductor_commands_total",
                &[("module", "motion"), ("outcome", "rejected")]
            )
            .map(|s| s.count),
            Some(1)
        );
    }

    #[tokio::test]
    async fn motion_completion_returns_to_active() {
        let orch = Orchestrator::new(fast_config());
        add(
            &orch,
            motion(),
            SimModule::new("motion").with_motion_duration(Duration::from_millis(30)),
        );
        orch.start_all().await.unwrap();
        orch.apply_mode_event(ModeEvent::Activate, "operator").unwrap();
        orch.dispatch("motion", walk()).await.unwrap();
        assert_eq!(orch.mode(), RobotMode::Moving);

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(orch.mode(), RobotMode::Active);
    }

    #[tokio::test]
    async fn failed_motion_command_reverts_moving() {
        let orch = Orchestrator::new(fast_config());
        add(&orch, motion(), SimModule::new("motion").failing_commands("stalled"));
        orch.start_all().await.unwrap();
        orch.apply_mode_event(ModeEvent::Activate, "operator").unwrap();
        let err = orch.dispatch("motion", walk()).await.unwrap_err();
        assert!(matches!(err, CommandError::Failed { .. }));
        assert_eq!(orch.mode(), RobotMode::Active);
    }

    #[tokio::test]
    async fn command_timeout_degrades_module() {
        let orch = Orchestrator::new(fast_config());
        add(
            &orch,
            led(),
            SimModule::new("led").with_command_delay(Duration::from_millis(400)),
        );
        orch.start_all().await.unwrap();

        let started = Instant::now();
        let err = orch.dispatch("led", Command::new("blink")).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(matches!(err, CommandError::Timeout { timeout_ms: 100, .. }));

        assert_eq!(orch.module_status("led"), Some(ModuleStatus::Degraded));
        assert_eq!(
            orch.health_record("led").map(|r| r.status),
            Some(HealthStatus::Degraded)
        );
        assert_eq!(orch.mode(), RobotMode::Degraded);
    }

    #[tokio::test]
    async fn stop_reaches_motion_module_while_degraded() {
        let orch = Orchestrator::new(fast_config());
        let motion_sim = add(&orch, motion(), SimModule::new("motion"));
        let led_sim = add(
            &orch,
            led(),
            SimModule::new("led").with_command_delay(Duration::from_millis(400)),
        );
        orch.start_all().await.unwrap();
        orch.apply_mode_event(ModeEvent::Activate, "operator").unwrap();
        orch.dispatch("motion", walk()).await.unwrap();
        assert_eq!(orch.mode(), RobotMode::Moving);

        let err = orch.dispatch("led", Command::new("blink")).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
        assert_eq!(orch.mode(), RobotMode::Degraded);

        orch.dispatch("motion", Command::new("stop")).await.unwrap();
        assert!(motion_sim.dispatched().iter().any(Command::is_stop));
        assert_eq!(orch.mode(), RobotMode::Degraded);

        led_sim.inject(EventPayload::Heartbeat);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.mode(), RobotMode::Active);
    }

    #[tokio::test]
    async fn timed_out_motion_does_not_resume_after_recovery() {
        let orch = Orchestrator::new(fast_config());
        let sim = add(
            &orch,
            motion(),
            SimModule::new("motion").with_command_delay(Duration::from_millis(400)),
        );
        orch.start_all().await.unwrap();
        orch.apply_mode_event(ModeEvent::Activate, "operator").unwrap();

        let err = orch.dispatch("motion", walk()).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
        assert_eq!(orch.mode(), RobotMode::Degraded);

        sim.inject(EventPayload::Heartbeat);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.mode(), RobotMode::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_while_starting_does_not_deadlock() {
        let orch = Orchestrator::new(fast_config());
        for i in 0..8 {
            let id = format!("led{i}");
            add(
                &orch,
                ModuleDescriptor::new(id.as_str()).with_capability(Capability::Led),
                SimModule::new(id.as_str()),
            );
        }

        let observer = orch.clone();
        let polling = tokio::task::spawn_blocking(move || {
            for _ in 0..500 {
                let status = observer.status();
                assert_eq!(status.modules.len(), 8);
            }
        });
        let starting = orch.start_all();

        let (polled, started) = time::timeout(Duration::from_secs(5), async {
            tokio::join!(polling, starting)
        })
        .await
        .expect("status and startup finish without deadlock");
        polled.unwrap();
        started.unwrap();
    }

    #[tokio::test]
    async fn unknown_and_stopped_modules_refuse_commands() {
        let orch = Orchestrator::new(fast_config());
        add(&orch, led(), SimModule::new("led"));
        assert!(matches!(
            orch.dispatch("ghost", Command::new("x")).await,
            Err(CommandError::UnknownModule(_))
        ));
        assert!(matches!(
            orch.dispatch("led", Command::new("x")).await,
            Err(CommandError::Unavailable {
                status: ModuleStatus::Uninitialized,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unresponsive_module_faults_exactly_once() {
        let orch = Orchestrator::new(OrchestratorConfig {
            health: HealthConfig {
                heartbeat_interval_ms: 20,
                ..HealthConfig::default()
            },
            ..fast_config()
        });
        let sim = add(&orch, led(), SimModule::new("led"));
        orch.start_all().await.unwrap();
        let mut alerts = orch.bus().subscribe_to(Topic::Alerts);

        sim.set_silent(true);
        time::sleep(Duration::from_millis(300)).await;

        let faults = drain(&mut alerts)
            .await
            .into_iter()
            .filter(|e| {
                e.source_module_id == "led"
                    && matches!(
                        e.payload,
                        EventPayload::Fault {
                            code: FAULT_UNRESPONSIVE,
                            fatal: true,
                            ..
                        }
                    )
            })
            .count();
        assert_eq!(faults, 1);
        assert_eq!(orch.mode(), RobotMode::Error);
        assert_eq!(
            orch.health_record("led").map(|r| r.status),
            Some(HealthStatus::Unresponsive)
        );
        assert_eq!(orch.module_status("led"), Some(ModuleStatus::Degraded));
    }

    #[tokio::test]
    async fn unresponsive_motion_module_triggers_emergency() {
        let orch = Orchestrator::new(OrchestratorConfig {
            health: HealthConfig {
                heartbeat_interval_ms: 20,
                ..HealthConfig::default()
            },
            ..fast_config()
        });
        let sim = add(&orch, motion(), SimModule::new("motion"));
        orch.start_all().await.unwrap();
        sim.set_silent(true);
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(orch.mode(), RobotMode::Emergency);
    }

    #[tokio::test]
    async fn restart_policy_revives_unresponsive_module() {
        let mut config = OrchestratorConfig {
            health: HealthConfig {
                heartbeat_interval_ms: 20,
                ..HealthConfig::default()
            },
            ..fast_config()
        };
        config.restart_overrides.insert(
            "led".into(),
            RestartPolicy {
                enabled: true,
                initial_backoff_ms: 10,
                ..RestartPolicy::default()
            },
        );
        let orch = Orchestrator::new(config);
        let sim = add(&orch, led(), SimModule::new("led"));
        orch.start_all().await.unwrap();

        sim.set_silent(true);
        time::sleep(Duration::from_millis(400)).await;

        assert_eq!(sim.start_calls(), 2);
        assert_eq!(orch.module_status("led"), Some(ModuleStatus::Running));
        let snap = orch.metrics_snapshot();
        assert_eq!(
            snap.find("conductor_module_restarts_total", &[("module", "led")])
                .map(|s| s.count),
            Some(1)
        );
    }

    #[tokio::test]
    async fn fatal_fault_fails_module() {
        let orch = Orchestrator::new(fast_config());
        let sim = add(&orch, led(), SimModule::new("led"));
        orch.start_all().await.unwrap();
        time::sleep(Duration::from_millis(20)).await;

        sim.inject(EventPayload::Fault {
            code: 7,
            message: "driver crashed".into(),
            fatal: true,
        });
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.module_status("led"), Some(ModuleStatus::Failed));
        assert_eq!(orch.mode(), RobotMode::Error);

        let state = orch.apply_mode_event(ModeEvent::ErrorReset, "fixed").unwrap();
        assert_eq!(state.mode, RobotMode::Standby);
    }

    #[tokio::test]
    async fn samples_are_fused_into_frames() {
        let orch = Orchestrator::new(OrchestratorConfig {
            fusion: FusionConfig {
                window_ms: 20,
                expected: [
                    ("imu".to_string(), "body".to_string()),
                    ("battery".to_string(), "body".to_string()),
                    ("temperature".to_string(), "thermal".to_string()),
                ]
                .into_iter()
                .collect(),
                ..FusionConfig::default()
            },
            ..fast_config()
        });
        add(
            &orch,
            ModuleDescriptor::new("body").with_capability(Capability::Sensing),
            SimModule::new("body")
                .with_sensor(SimSensor::new("imu", Duration::from_millis(5)).with_value(vec![0.1, 0.2]))
                .with_sensor(SimSensor::new("battery", Duration::from_millis(5)).with_value(vec![87.0])),
        );
        let mut frames = orch.subscribe_frames();
        orch.start_all().await.unwrap();

        let mut fused = None;
        for _ in 0..50 {
            if time::timeout(Duration::from_millis(200), frames.changed())
                .await
                .is_err()
            {
                break;
            }
            let frame = frames.borrow_and_update().clone();
            if let Some(frame) = frame.filter(|f| f.sample("imu").is_some() && f.sample("battery").is_some()) {
                fused = Some(frame);
                break;
            }
        }
        let frame = fused.expect("no complete frame produced");
        assert!((frame.completeness - 2.0 / 3.0).abs() < 1e-9);
        assert!(frame.sample("temperature").is_none());
        assert_eq!(frame.sample("imu").map(|s| s.module_id.as_str()), Some("body"));

        assert!(orch.latest_frame().is_some());
        let status = orch.status();
        assert!(status.fusion.frames_produced > 0);
        assert!(status.fusion_confidence.is_some());
    }

    #[tokio::test]
    async fn shutdown_tolerates_slow_modules() {
        let orch = Orchestrator::new(fast_config());
        let motion_sim = add(&orch, motion(), SimModule::new("motion"));
        let balance = add(
            &orch,
            ModuleDescriptor::new("balance").depends_on("motion"),
            SimModule::new("balance").with_stop_delay(Duration::from_secs(2)),
        );
        add(&orch, led(), SimModule::new("led"));
        orch.start_all().await.unwrap();

        let started = Instant::now();
        let report = orch.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(report.failed, vec!["balance".to_string()]);
        assert!(report.stopped.contains(&"motion".to_string()));
        assert!(report.stopped.contains(&"led".to_string()));
        assert_eq!(orch.module_status("balance"), Some(ModuleStatus::Failed));
        assert_eq!(orch.module_status("motion"), Some(ModuleStatus::Stopped));
        assert_eq!(motion_sim.stop_calls(), 1);
        assert_eq!(balance.stop_calls(), 1);

        // Idempotent.
        assert_eq!(orch.shutdown().await, report);
        assert_eq!(motion_sim.stop_calls(), 1);
    }

    #[tokio::test]
    async fn status_lists_modules_and_history() {
        let orch = Orchestrator::new(fast_config());
        add(&orch, led(), SimModule::new("led"));
        orch.start_all().await.unwrap();
        let status = orch.status();
        assert_eq!(status.state.mode, RobotMode::Standby);
        assert_eq!(status.modules.len(), 1);
        assert_eq!(status.health.len(), 1);
        assert_eq!(status.history.len(), 1);
        assert!(orch.prometheus().contains("conductor_mode_transitions_total"));
    }
}
