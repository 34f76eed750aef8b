//! Service around the acquisition pipeline: configuration, telemetry sinks
//! and the long-running bridge loop.
//!
//! # Configuration
//!
//! The service reads `~/.config/blebridge/config.toml` (see
//! [`config::default_config_path`]); every key has a default:
//!
//! ```toml
//! [bridge]
//! name = "attic"
//! scan_window_secs = 5
//! cycle_pause_secs = 5
//! release_wait_ms = 1000
//! connect_timeout_secs = 10
//! cycle_deadline_secs = 300
//! pairing_timeout_secs = 30
//!
//! [influx]
//! enabled = true
//! url = "http://localhost:8086"
//! version = "v2"
//! org = "home"
//! bucket = "sensors"
//! token = "..."
//!
//! [mqtt]
//! enabled = true
//! broker = "mqtt://localhost:1883"
//! topic_prefix = "blebridge"
//! discovery_prefix = "homeassistant"
//! ```
//!
//! # Exit Codes
//!
//! The bridge exits with [`bridge::EX_TEMPFAIL`] (75) when the radio stops
//! responding, so that systemd or the container runtime restarts it.

pub mod bridge;
pub mod config;
pub mod influx;
pub mod mqtt;

pub use bridge::{EX_TEMPFAIL, Shutdown};
pub use config::{BridgeConfig, Config, ConfigError, InfluxConfig, InfluxVersion, MqttConfig};
pub use influx::InfluxSink;
pub use mqtt::MqttSink;
