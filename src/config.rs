//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. `config/vna_stream.toml` (base configuration)
//! 2. Environment variables prefixed with `VNA_STREAM_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use vna_stream::config::VnaConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VnaConfig::load()?;
//! config.validate()?;
//! println!("Instrument: {}:{}", config.instrument.host, config.instrument.command_port);
//! # Ok(())
//! # }
//! ```
//!
//! Override a single value from the shell:
//! `VNA_STREAM_ACQUISITION__TOTAL_SWEEPS=50`

use crate::error::{VnaError, VnaResult};
use crate::measurement::PortId;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/vna_stream.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VnaConfig {
    /// Name and log level.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Where the analyzer listens.
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// How the acquisition engine process is run.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Collection limits and timeouts.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// SCPI strings sent to the instrument.
    #[serde(default)]
    pub commands: CommandConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Where the instrument lives and how its sockets are laid out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Hostname or IP address of the machine running the acquisition engine
    #[serde(default = "default_host")]
    pub host: String,
    /// SCPI command port
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    /// Logical port id -> TCP port of its push-data stream
    #[serde(default = "default_push_ports")]
    pub push_ports: BTreeMap<String, u16>,
    /// Socket connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Use the simulated instrument instead of real sockets
    #[serde(default)]
    pub mock: bool,
}

/// Acquisition engine process control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable of the acquisition engine. `None` means it is supervised elsewhere.
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Arguments passed to `program`
    #[serde(default)]
    pub args: Vec<String>,
    /// How long a cold start may take before the engine answers SCPI
    #[serde(default = "default_engine_start_timeout")]
    pub start_timeout_ms: u64,
    /// Cold-start attempts before giving up
    #[serde(default = "default_engine_start_attempts")]
    pub start_attempts: u32,
    /// Delay between reachability polls while the engine boots
    #[serde(default = "default_engine_poll_interval")]
    pub poll_interval_ms: u64,
    /// Grace period for the process to exit after being killed
    #[serde(default = "default_engine_stop_timeout")]
    pub stop_timeout_ms: u64,
}

/// Collection behaviour and command timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Stop after this many delivered sweeps; `None` collects until cancelled
    #[serde(default)]
    pub total_sweeps: Option<u64>,
    /// Bound on every SCPI round trip
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Bound on the identification query
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Delay between automatic probe retries after a transient failure
    #[serde(default = "default_probe_retry_interval")]
    pub probe_retry_interval_ms: u64,
    /// Maximum wait for the first complete sweep after continuous mode is enabled
    #[serde(default = "default_first_sweep_timeout")]
    pub first_sweep_timeout_ms: u64,
    /// Calibration artifact read at session start
    #[serde(default)]
    pub calibration_path: Option<PathBuf>,
}

/// SCPI command strings.
///
/// `sweep_setup` entries are templates rendered with `{start_hz}`, `{stop_hz}` and
/// `{num_points}` from the calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Identification query
    #[serde(default = "default_identify")]
    pub identify: String,
    /// Query answered once the engine accepts commands
    #[serde(default = "default_engine_ready")]
    pub engine_ready: String,
    /// Enable continuous sweeping
    #[serde(default = "default_continuous_on")]
    pub continuous_on: String,
    /// Disable continuous sweeping
    #[serde(default = "default_continuous_off")]
    pub continuous_off: String,
    /// Templates sent before continuous mode is enabled
    #[serde(default = "default_sweep_setup")]
    pub sweep_setup: Vec<String>,
}

// Default value functions
fn default_name() -> String {
    "vna-stream".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_command_port() -> u16 {
    5025
}

fn default_push_ports() -> BTreeMap<String, u16> {
    BTreeMap::from([("S11".to_string(), 5026), ("S21".to_string(), 5027)])
}

fn default_connect_timeout() -> u64 {
    3000
}

fn default_engine_start_timeout() -> u64 {
    45_000
}

fn default_engine_start_attempts() -> u32 {
    2
}

fn default_engine_poll_interval() -> u64 {
    500
}

fn default_engine_stop_timeout() -> u64 {
    5000
}

fn default_command_timeout() -> u64 {
    2000
}

fn default_probe_timeout() -> u64 {
    3000
}

fn default_probe_retry_interval() -> u64 {
    5000
}

fn default_first_sweep_timeout() -> u64 {
    30_000
}

fn default_identify() -> String {
    "*IDN?".to_string()
}

fn default_engine_ready() -> String {
    "*OPC?".to_string()
}

fn default_continuous_on() -> String {
    "INIT:CONT ON".to_string()
}

fn default_continuous_off() -> String {
    "INIT:CONT OFF".to_string()
}

fn default_sweep_setup() -> Vec<String> {
    vec![
        "SENS:FREQ:STAR {start_hz}".to_string(),
        "SENS:FREQ:STOP {stop_hz}".to_string(),
        "SENS:SWE:POIN {num_points}".to_string(),
    ]
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            command_port: default_command_port(),
            push_ports: default_push_ports(),
            connect_timeout_ms: default_connect_timeout(),
            mock: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            start_timeout_ms: default_engine_start_timeout(),
            start_attempts: default_engine_start_attempts(),
            poll_interval_ms: default_engine_poll_interval(),
            stop_timeout_ms: default_engine_stop_timeout(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            total_sweeps: None,
            command_timeout_ms: default_command_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            probe_retry_interval_ms: default_probe_retry_interval(),
            first_sweep_timeout_ms: default_first_sweep_timeout(),
            calibration_path: None,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            identify: default_identify(),
            engine_ready: default_engine_ready(),
            continuous_on: default_continuous_on(),
            continuous_off: default_continuous_off(),
            sweep_setup: default_sweep_setup(),
        }
    }
}

impl VnaConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> VnaResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Missing keys fall back to their defaults; a missing file yields the defaults
    /// overlaid with the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> VnaResult<Self> {
        let config = Figment::from(Serialized::defaults(VnaConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VNA_STREAM_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> VnaResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(VnaError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.instrument.host.trim().is_empty() {
            return Err(VnaError::Configuration("'host' cannot be empty".into()));
        }

        if self.instrument.push_ports.is_empty() {
            return Err(VnaError::Configuration(
                "At least one push port must be configured".into(),
            ));
        }

        if self.instrument.command_port == 0
            || self.instrument.push_ports.values().any(|p| *p == 0)
        {
            return Err(VnaError::Configuration("TCP ports cannot be 0".into()));
        }

        let timeouts = [
            ("connect_timeout_ms", self.instrument.connect_timeout_ms),
            ("start_timeout_ms", self.engine.start_timeout_ms),
            ("poll_interval_ms", self.engine.poll_interval_ms),
            ("command_timeout_ms", self.acquisition.command_timeout_ms),
            ("probe_timeout_ms", self.acquisition.probe_timeout_ms),
            ("first_sweep_timeout_ms", self.acquisition.first_sweep_timeout_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(VnaError::Configuration(format!("'{name}' must be non-zero")));
        }

        if self.engine.start_attempts == 0 {
            return Err(VnaError::Configuration(
                "'start_attempts' must be at least 1".into(),
            ));
        }

        if self.acquisition.total_sweeps == Some(0) {
            return Err(VnaError::Configuration(
                "'total_sweeps' must be positive when set".into(),
            ));
        }

        let commands = [
            &self.commands.identify,
            &self.commands.engine_ready,
            &self.commands.continuous_on,
            &self.commands.continuous_off,
        ];
        if commands.iter().any(|c| c.trim().is_empty()) {
            return Err(VnaError::Configuration("SCPI commands cannot be empty".into()));
        }

        Ok(())
    }

    /// Logical ports in configuration order.
    pub fn ports(&self) -> Vec<PortId> {
        self.instrument
            .push_ports
            .keys()
            .map(|name| PortId::new(name.as_str()))
            .collect()
    }
}

impl InstrumentConfig {
    /// `connect_timeout_ms` as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl EngineConfig {
    /// `start_timeout_ms` as a `Duration`.
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// `poll_interval_ms` as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `stop_timeout_ms` as a `Duration`.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl AcquisitionConfig {
    /// `command_timeout_ms` as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// `probe_timeout_ms` as a `Duration`.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// `probe_retry_interval_ms` as a `Duration`.
    pub fn probe_retry_interval(&self) -> Duration {
        Duration::from_millis(self.probe_retry_interval_ms)
    }

    /// `first_sweep_timeout_ms` as a `Duration`.
    pub fn first_sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.first_sweep_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = VnaConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ports(), vec![PortId::new("S11"), PortId::new("S21")]);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = VnaConfig::default();
        config.application.log_level = "chatty".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_total_sweeps() {
        let mut config = VnaConfig::default();
        config.acquisition.total_sweeps = Some(0);
        assert!(matches!(
            config.validate(),
            Err(VnaError::Configuration(msg)) if msg.contains("total_sweeps")
        ));
    }

    #[test]
    fn rejects_missing_push_ports() {
        let mut config = VnaConfig::default();
        config.instrument.push_ports.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut config = VnaConfig::default();
        config.acquisition.command_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(VnaError::Configuration(msg)) if msg.contains("command_timeout_ms")
        ));
    }
}
