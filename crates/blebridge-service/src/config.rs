//! Bridge configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use blebridge_core::{CONNECT_DEADLINE, DEFAULT_CONNECT_TIMEOUT, SchedulerConfig};

/// Bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub influx: InfluxConfig,
    pub mqtt: MqttConfig,
}

impl Config {
    /// Load configuration from the default path, or defaults when it does
    /// not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, collecting every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use blebridge_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.bridge.validate();
        errors.extend(self.influx.validate());
        errors.extend(self.mqtt.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name of this bridge; tags every point it emits.
    pub name: String,
    pub scan_window_secs: u64,
    /// Pause between the end of one cycle and the start of the next.
    pub cycle_pause_secs: u64,
    /// Bounded wait for the radio to release the previous connection.
    pub release_wait_ms: u64,
    /// Time the adapter gets to reach a device before it counts as
    /// unreachable. Must stay below the connect watchdog deadline.
    pub connect_timeout_secs: u64,
    pub cycle_deadline_secs: u64,
    pub registry_path: PathBuf,
    /// How long a pairing flow waits for the PIN.
    pub pairing_timeout_secs: u64,
}

/// Scan windows accepted by validation, in seconds.
pub const MIN_SCAN_WINDOW: u64 = 1;
pub const MAX_SCAN_WINDOW: u64 = 60;

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "blebridge".to_string(),
            scan_window_secs: 5,
            cycle_pause_secs: 5,
            release_wait_ms: 1000,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            cycle_deadline_secs: 300,
            registry_path: default_registry_path(),
            pairing_timeout_secs: 30,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(ValidationError::new("bridge.name", "bridge name cannot be empty"));
        }
        if !(MIN_SCAN_WINDOW..=MAX_SCAN_WINDOW).contains(&self.scan_window_secs) {
            errors.push(ValidationError::new(
                "bridge.scan_window_secs",
                format!(
                    "scan window {} out of range ({}-{} seconds)",
                    self.scan_window_secs, MIN_SCAN_WINDOW, MAX_SCAN_WINDOW
                ),
            ));
        }
        if self.cycle_deadline_secs <= self.scan_window_secs {
            errors.push(ValidationError::new(
                "bridge.cycle_deadline_secs",
                format!(
                    "cycle deadline {} must exceed the scan window ({} seconds)",
                    self.cycle_deadline_secs, self.scan_window_secs
                ),
            ));
        }
        if self.connect_timeout_secs == 0 || self.connect_timeout() >= CONNECT_DEADLINE {
            errors.push(ValidationError::new(
                "bridge.connect_timeout_secs",
                format!(
                    "connect timeout {} must be between 1 and {} seconds",
                    self.connect_timeout_secs,
                    CONNECT_DEADLINE.as_secs() - 1
                ),
            ));
        }
        if self.pairing_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "bridge.pairing_timeout_secs",
                "pairing timeout cannot be 0",
            ));
        }
        if self.registry_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "bridge.registry_path",
                "registry path cannot be empty",
            ));
        }

        errors
    }

    /// Scheduler timing derived from this section.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            scan_window: Duration::from_secs(self.scan_window_secs),
            release_wait: Duration::from_millis(self.release_wait_ms),
            cycle_deadline: Duration::from_secs(self.cycle_deadline_secs),
            pairing_timeout: Duration::from_secs(self.pairing_timeout_secs),
            ..SchedulerConfig::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_secs(self.cycle_pause_secs)
    }
}

/// InfluxDB write API flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfluxVersion {
    /// `/write?db=` with optional basic credentials.
    V1,
    /// `/api/v2/write?org=&bucket=` with a token.
    #[default]
    V2,
}

/// InfluxDB sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub enabled: bool,
    /// Base URL, e.g. `http://localhost:8086`.
    pub url: String,
    pub version: InfluxVersion,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    /// Database for v1 servers.
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Points per HTTP write.
    pub batch_size: usize,
    /// Points held between flushes; the oldest are dropped beyond this.
    pub max_buffer: usize,
    pub timeout_secs: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:8086".to_string(),
            version: InfluxVersion::V2,
            org: String::new(),
            bucket: "blebridge".to_string(),
            token: None,
            database: "blebridge".to_string(),
            username: None,
            password: None,
            batch_size: 30,
            max_buffer: 1000,
            timeout_secs: 10,
        }
    }
}

impl InfluxConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !self.enabled {
            return errors;
        }

        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            errors.push(ValidationError::new(
                "influx.url",
                format!("invalid URL '{}': must start with http:// or https://", self.url),
            ));
        }
        match self.version {
            InfluxVersion::V2 => {
                if self.org.is_empty() {
                    errors.push(ValidationError::new("influx.org", "org is required for v2"));
                }
                if self.bucket.is_empty() {
                    errors.push(ValidationError::new("influx.bucket", "bucket is required for v2"));
                }
            }
            InfluxVersion::V1 => {
                if self.database.is_empty() {
                    errors.push(ValidationError::new(
                        "influx.database",
                        "database is required for v1",
                    ));
                }
            }
        }
        if self.batch_size == 0 {
            errors.push(ValidationError::new("influx.batch_size", "batch size cannot be 0"));
        }
        if self.max_buffer < self.batch_size {
            errors.push(ValidationError::new(
                "influx.max_buffer",
                format!(
                    "buffer of {} points cannot hold one batch of {}",
                    self.max_buffer, self.batch_size
                ),
            ));
        }

        errors
    }
}

/// MQTT sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    /// `mqtt://host[:port]` or `mqtts://host[:port]`.
    pub broker: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    /// Home Assistant discovery prefix.
    pub discovery_prefix: String,
    /// 0, 1 or 2.
    pub qos: u8,
    pub retain: bool,
    pub keep_alive: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: "mqtt://localhost:1883".to_string(),
            client_id: "blebridge".to_string(),
            username: None,
            password: None,
            topic_prefix: "blebridge".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            qos: 1,
            retain: false,
            keep_alive: 30,
        }
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !self.enabled {
            return errors;
        }

        if !(self.broker.starts_with("mqtt://") || self.broker.starts_with("mqtts://")) {
            errors.push(ValidationError::new(
                "mqtt.broker",
                format!(
                    "invalid broker URL '{}': must start with mqtt:// or mqtts://",
                    self.broker
                ),
            ));
        }
        if self.client_id.is_empty() {
            errors.push(ValidationError::new("mqtt.client_id", "client id cannot be empty"));
        }
        for (field, value) in [
            ("mqtt.topic_prefix", &self.topic_prefix),
            ("mqtt.discovery_prefix", &self.discovery_prefix),
        ] {
            if value.is_empty() {
                errors.push(ValidationError::new(field, "prefix cannot be empty"));
            } else if value.contains(['#', '+']) {
                errors.push(ValidationError::new(
                    field,
                    format!("prefix '{value}' cannot contain MQTT wildcards"),
                ));
            }
        }
        if self.qos > 2 {
            errors.push(ValidationError::new(
                "mqtt.qos",
                format!("invalid QoS {}: must be 0, 1 or 2", self.qos),
            ));
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `bridge.name` or `mqtt.qos`).
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blebridge")
        .join("config.toml")
}

/// Default location of the device registry.
pub fn default_registry_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blebridge")
        .join("devices.json")
}
