//! Configuration file – reads/writes `~/.conductor/config.toml`.
//!
//! Every section has serde defaults, so a partial file (or none at all)
//! yields a runnable setup.  `[[modules]]` entries declare the simulated
//! modules the CLI registers on startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use conductor_gateway::{DEFAULT_COMMANDS_PER_SECOND, DEFAULT_PORT};
use conductor_hal::{ModuleConfig, SimModule, SimSensor};
use conductor_runtime::{LogFormat, LoggingConfig, OrchestratorConfig};
use conductor_types::{Capability, ConductorError, ModuleDescriptor, SampleQuality};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    /// Command submissions accepted per second, across all clients.
    pub commands_per_second: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            commands_per_second: DEFAULT_COMMANDS_PER_SECOND,
        }
    }
}

/// A sensor stream emitted by a simulated module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntry {
    pub sensor_type: String,
    #[serde(default = "default_sensor_period_ms")]
    pub period_ms: u64,
    #[serde(default)]
    pub value: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<SampleQuality>,
}

fn default_sensor_period_ms() -> u64 {
    20
}

/// One `[[modules]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    /// Pushed heartbeat period; defaults to half the health interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_ms: Option<u64>,
    /// How long a simulated motion takes before `motion_complete`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

impl ModuleEntry {
    fn new(id: &str, capabilities: &[Capability]) -> Self {
        Self {
            id: id.to_string(),
            capabilities: capabilities.to_vec(),
            dependencies: Vec::new(),
            sensors: Vec::new(),
            heartbeat_ms: None,
            motion_duration_ms: None,
            parameters: serde_json::Value::Null,
        }
    }

    fn depends_on(mut self, id: &str) -> Self {
        self.dependencies.push(id.to_string());
        self
    }

    fn sensor(mut self, sensor_type: &str, period_ms: u64, value: Vec<f64>) -> Self {
        self.sensors.push(SensorEntry {
            sensor_type: sensor_type.to_string(),
            period_ms,
            value,
            quality: None,
        });
        self
    }

    pub fn descriptor(&self) -> ModuleDescriptor {
        let descriptor = self
            .capabilities
            .iter()
            .fold(ModuleDescriptor::new(&self.id), |d, c| d.with_capability(*c));
        self.dependencies
            .iter()
            .fold(descriptor, |d, dep| d.depends_on(dep))
    }

    pub fn module_config(&self) -> ModuleConfig {
        ModuleConfig::new(&self.id).with_parameters(self.parameters.clone())
    }

    /// Build the simulated module; `health_interval` sets the default
    /// heartbeat period.
    pub fn simulate(&self, health_interval: Duration) -> SimModule {
        let heartbeat = self
            .heartbeat_ms
            .map(Duration::from_millis)
            .unwrap_or(health_interval / 2);
        let mut module = SimModule::new(&self.id).with_heartbeat(heartbeat);
        if let Some(ms) = self.motion_duration_ms {
            module = module.with_motion_duration(Duration::from_millis(ms));
        }
        for s in &self.sensors {
            let mut sensor = SimSensor::new(&s.sensor_type, Duration::from_millis(s.period_ms.max(1)));
            if !s.value.is_empty() {
                sensor = sensor.with_value(s.value.clone());
            }
            if let Some(q) = s.quality {
                sensor = sensor.with_quality(q);
            }
            module = module.with_sensor(sensor);
        }
        module
    }
}

/// Persisted configuration stored in `~/.conductor/config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub orchestrator: OrchestratorConfig,
    pub gateway: GatewayConfig,
    pub logging: LoggingConfig,
    pub modules: Vec<ModuleEntry>,
}

impl ConductorConfig {
    /// The configuration written on first run: a small simulated humanoid.
    pub fn demo() -> Self {
        let modules = vec![
            ModuleEntry::new("power", &[Capability::Sensing]).sensor("battery", 100, vec![0.87]),
            ModuleEntry::new("motion", &[Capability::Motion])
                .depends_on("power")
                .sensor("joint_state", 20, vec![0.0; 12]),
            ModuleEntry::new("balance", &[Capability::Sensing])
                .depends_on("motion")
                .sensor("imu", 10, vec![0.0, 0.0, 9.81]),
            ModuleEntry::new("audio", &[Capability::Audio]).depends_on("power"),
            ModuleEntry::new("led", &[Capability::Led]),
        ];
        let mut cfg = Self {
            modules,
            ..Self::default()
        };
        for m in &cfg.modules {
            for s in &m.sensors {
                cfg.orchestrator
                    .fusion
                    .expected
                    .insert(s.sensor_type.clone(), m.id.clone());
            }
        }
        cfg
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Paths
// ────────────────────────────────────────────────────────────────────────────

/// Return the config path: `$CONDUCTOR_CONFIG` or `~/.conductor/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("CONDUCTOR_CONFIG")
        && !p.is_empty()
    {
        return PathBuf::from(p);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".conductor").join("config.toml")
}

// ────────────────────────────────────────────────────────────────────────────
// Load / save
// ────────────────────────────────────────────────────────────────────────────

/// Load the config and apply `CONDUCTOR_*` overrides.  Returns `None` if the
/// file does not exist.
pub fn load() -> Result<Option<ConductorConfig>, ConductorError> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<ConductorConfig>, ConductorError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        ConductorError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| ConductorError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Apply `CONDUCTOR_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `CONDUCTOR_GATEWAY_PORT` | `gateway.port` |
/// | `CONDUCTOR_LOG_FORMAT` | `logging.format` (`compact` / `json`) |
/// | `CONDUCTOR_COMMAND_TIMEOUT_MS` | `orchestrator.command_timeout_ms` |
/// | `CONDUCTOR_FUSION_WINDOW_MS` | `orchestrator.fusion.window_ms` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut ConductorConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut ConductorConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CONDUCTOR_GATEWAY_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.gateway.port = port;
    }
    if let Some(v) = var("CONDUCTOR_LOG_FORMAT") {
        match v.to_ascii_lowercase().as_str() {
            "json" => cfg.logging.format = LogFormat::Json,
            "compact" => cfg.logging.format = LogFormat::Compact,
            _ => {}
        }
    }
    if let Some(v) = var("CONDUCTOR_COMMAND_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
        && ms > 0
    {
        cfg.orchestrator.command_timeout_ms = ms;
    }
    if let Some(v) = var("CONDUCTOR_FUSION_WINDOW_MS")
        && let Ok(ms) = v.parse::<u64>()
        && ms > 0
    {
        cfg.orchestrator.fusion.window_ms = ms;
    }
}

/// Save the config, creating the parent directory if necessary.
pub fn save(cfg: &ConductorConfig) -> Result<(), ConductorError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &ConductorConfig, path: &Path) -> Result<(), ConductorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            ConductorError::Config(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| ConductorError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        ConductorError::Config(format!("failed to write {}: {e}", path.display()))
    })
}
