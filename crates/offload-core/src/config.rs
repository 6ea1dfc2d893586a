//! Configuration system for the offload broker and the edge-device driver.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $OFFLOAD_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/offload/config.toml
//!   3. ~/.config/offload/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::{DEFAULT_MAX_PAYLOAD, DEFAULT_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
}

// ── Broker (EC side) ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the broker listens on.
    pub listen_addr: String,
    pub admission: AdmissionSettings,
    /// How long a granted slot waits for the client's OK.
    pub ack_timeout_ms: u64,
    /// How long the payload frame may take to arrive after OK.
    pub payload_timeout_ms: u64,
    pub max_payload_bytes: u64,
    /// Grace period for in-flight connections on shutdown.
    pub shutdown_grace_ms: u64,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSettings {
    /// Estimated marginal wait contributed by one queued task, calibrated
    /// per hardware pairing.
    pub per_task_cost_ms: f64,
    pub latency_budget_ms: f64,
    pub mode: AdmissionMode,
}

/// How the latency budget is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Hard bound: requests whose estimated wait exceeds the budget get DROP.
    Enforce,
    /// Tuning knob: everything is admitted, over-budget estimates are logged.
    Observe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Model the broker reports loading at startup.
    pub model: String,
    /// Per-inference latency of the built-in simulated engine.
    pub simulated_latency_ms: u64,
}

// ── Device (ED side) ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Broker address, `host:port`.
    pub endpoint: String,
    pub model: String,
    pub device_tag: String,
    pub connect_timeout_ms: u64,
    /// Bounded wait for GRANT/DROP after REQ.
    pub response_timeout_ms: u64,
    /// Bounded wait for DONE after the payload was sent.
    pub done_timeout_ms: u64,
    /// Number of tasks allowed to talk to the broker concurrently.
    pub pool_size: usize,
    pub arrival: ArrivalSettings,
    pub limit: RunLimit,
    pub payload: PayloadSettings,
    pub local: LocalSettings,
    /// Upper bound on waiting for in-flight tasks and the local queue at the
    /// end of a run.
    pub drain_timeout_ms: u64,
}

/// Arrival process of generated tasks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArrivalSettings {
    /// One task every `1000 / tasks_per_sec` ms.
    FixedRate { tasks_per_sec: f64 },
    /// Exponential inter-arrival times with mean `1 / rate_per_sec` seconds.
    Poisson { rate_per_sec: f64 },
}

/// When a run stops generating tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunLimit {
    Count { tasks: u64 },
    Duration { secs: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadSettings {
    /// Fixed payload file. Used when `directory` is unset.
    pub path: PathBuf,
    /// Pick a random regular file from this directory for every task.
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub runtime: LocalRuntimeKind,
    /// External worker command (runtime = external).
    pub command: String,
    pub args: Vec<String>,
    /// Per-inference latency of the in-process simulated engine.
    pub simulated_latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalRuntimeKind {
    InProcess,
    External,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            admission: AdmissionSettings::default(),
            ack_timeout_ms: 5_000,
            payload_timeout_ms: 30_000,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD,
            shutdown_grace_ms: 5_000,
            engine: EngineSettings::default(),
        }
    }
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            per_task_cost_ms: 68.71,
            latency_budget_ms: 550.0,
            mode: AdmissionMode::Enforce,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model: "yolov5s6".to_string(),
            simulated_latency_ms: 69,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("127.0.0.1:{DEFAULT_PORT}"),
            model: "resnet_50".to_string(),
            device_tag: "PI5".to_string(),
            connect_timeout_ms: 2_000,
            response_timeout_ms: 2_000,
            done_timeout_ms: 30_000,
            pool_size: 32,
            arrival: ArrivalSettings::Poisson { rate_per_sec: 10.0 },
            limit: RunLimit::Count { tasks: 100 },
            payload: PayloadSettings::default(),
            local: LocalSettings::default(),
            drain_timeout_ms: 60_000,
        }
    }
}

impl Default for PayloadSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("000000006321.jpg"),
            directory: None,
        }
    }
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            runtime: LocalRuntimeKind::InProcess,
            command: String::new(),
            args: Vec::new(),
            simulated_latency_ms: 250,
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl BrokerConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn payload_timeout(&self) -> Duration {
        Duration::from_millis(self.payload_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn done_timeout(&self) -> Duration {
        Duration::from_millis(self.done_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("offload")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl OffloadConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    /// A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            OffloadConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("OFFLOAD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&OffloadConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply OFFLOAD_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OFFLOAD_BROKER__LISTEN_ADDR") {
            self.broker.listen_addr = v;
        }
        if let Ok(v) = std::env::var("OFFLOAD_BROKER__PER_TASK_COST_MS") {
            if let Ok(cost) = v.parse() {
                self.broker.admission.per_task_cost_ms = cost;
            }
        }
        if let Ok(v) = std::env::var("OFFLOAD_BROKER__LATENCY_BUDGET_MS") {
            if let Ok(budget) = v.parse() {
                self.broker.admission.latency_budget_ms = budget;
            }
        }
        if let Ok(v) = std::env::var("OFFLOAD_DEVICE__ENDPOINT") {
            self.device.endpoint = v;
        }
        if let Ok(v) = std::env::var("OFFLOAD_DEVICE__POOL_SIZE") {
            if let Ok(n) = v.parse() {
                self.device.pool_size = n;
            }
        }
    }

    /// Reject values that would make the run meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let admission = &self.broker.admission;
        if !admission.per_task_cost_ms.is_finite() || admission.per_task_cost_ms < 0.0 {
            return Err(ConfigError::Invalid(
                "broker.admission.per_task_cost_ms",
                admission.per_task_cost_ms.to_string(),
            ));
        }
        if !admission.latency_budget_ms.is_finite() || admission.latency_budget_ms < 0.0 {
            return Err(ConfigError::Invalid(
                "broker.admission.latency_budget_ms",
                admission.latency_budget_ms.to_string(),
            ));
        }
        if self.device.pool_size == 0 {
            return Err(ConfigError::Invalid("device.pool_size", "0".to_string()));
        }
        let rate = match self.device.arrival {
            ArrivalSettings::FixedRate { tasks_per_sec } => tasks_per_sec,
            ArrivalSettings::Poisson { rate_per_sec } => rate_per_sec,
        };
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::Invalid("device.arrival", rate.to_string()));
        }
        if self.device.local.runtime == LocalRuntimeKind::External
            && self.device.local.command.is_empty()
        {
            return Err(ConfigError::Invalid(
                "device.local.command",
                "external runtime needs a command".to_string(),
            ));
        }
        Ok(())
    }
}
