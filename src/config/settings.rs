//! Application settings

use crate::core::device::SimulatedDeviceConfig;
use crate::core::service::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Service timing and limits
    pub service: ServiceSettings,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Simulated devices for the demo binary
    pub simulator: SimulatorConfig,
}

impl AppConfig {
    /// Load config from the default location
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from `path`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = super::config_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_error)
    }

    /// Runtime service settings
    pub fn service_config(&self) -> ServiceConfig {
        self.service.to_service_config()
    }
}

/// `[service]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Discovery pass length in ms
    pub scan_window_ms: u64,
    /// How long scan-for-new keeps looking, in ms
    pub scan_for_new_timeout_ms: u64,
    /// Steady measurement length in ms
    pub steady_duration_ms: u64,
    /// Concurrently outstanding device commands
    pub max_in_flight_commands: usize,
    /// Transitions kept in the history
    pub history_size: usize,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        let defaults = ServiceConfig::default();
        Self {
            scan_window_ms: defaults.scan_window.as_millis() as u64,
            scan_for_new_timeout_ms: defaults.scan_for_new_timeout.as_millis() as u64,
            steady_duration_ms: defaults.steady_duration.as_millis() as u64,
            max_in_flight_commands: defaults.max_in_flight_commands,
            history_size: defaults.history_size,
            event_capacity: defaults.event_capacity,
        }
    }
}

impl ServiceSettings {
    pub fn to_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            scan_window: Duration::from_millis(self.scan_window_ms),
            scan_for_new_timeout: Duration::from_millis(self.scan_for_new_timeout_ms),
            steady_duration: Duration::from_millis(self.steady_duration_ms),
            max_in_flight_commands: self.max_in_flight_commands.max(1),
            history_size: self.history_size,
            event_capacity: self.event_capacity.max(1),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// `[simulator]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Simulated discovery pass length in ms
    pub scan_delay_ms: u64,
    pub devices: Vec<SimulatedDeviceConfig>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            scan_delay_ms: 200,
            devices: (1..=3)
                .map(|i| {
                    SimulatedDeviceConfig::new(format!("C0:FF:EE:00:00:0{i}"))
                        .with_name(format!("Notch-{i}"))
                        .with_latency(15, 10)
                })
                .collect(),
        }
    }
}
