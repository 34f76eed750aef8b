//! Error types for blebridge-core.
//!
//! Most errors are transient: the scheduler logs them, skips the device for
//! this cycle and tries again on the next one. Only [`Error::is_fatal`]
//! errors end the process, so that the supervisor restarts it with a fresh
//! radio stack.
//!
//! | Error | Handling |
//! |-------|----------|
//! | [`Error::Decode`] | keep the previous reading |
//! | [`Error::ConnectFailed`] with [`ConnectFailureReason::BondingRejected`] | demote to `NotPaired` |
//! | [`Error::ConnectFailed`] otherwise | retry next cycle |
//! | [`Error::Sink`] | logged by the dispatcher, never reaches acquisition |
//! | [`Error::Watchdog`], [`Error::RadioWedged`] | fatal, restart |

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use blebridge_types::{Family, ParseError};

use crate::registry::PairingState;

/// Errors raised by the acquisition pipeline.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy stack error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// A payload could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(#[from] ParseError),

    /// Connecting to a device failed.
    #[error("Connection to {address} failed: {reason}")]
    ConnectFailed {
        address: String,
        reason: ConnectFailureReason,
    },

    /// Operation attempted while not connected.
    #[error("Not connected to device")]
    NotConnected,

    /// The connected device does not expose a characteristic we need.
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    /// The address is neither registered nor in the scan cache.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Another pairing flow is already active.
    #[error("A pairing flow is already active for {0}")]
    PairingBusy(String),

    /// The device is not in a state that allows the requested transition.
    #[error("Device {address} is {state:?}; cannot {action}")]
    InvalidPairingState {
        address: String,
        state: PairingState,
        action: &'static str,
    },

    /// History was requested from a family without an on-board log.
    #[error("{0} devices do not keep a history log")]
    HistoryUnsupported(Family),

    /// A watchdog deadline expired.
    #[error("Watchdog expired: '{operation}' exceeded {deadline:?}")]
    Watchdog { operation: String, deadline: Duration },

    /// The scan returned far earlier than requested; the radio is stuck.
    #[error("Radio wedged: scan lasted {measured:?} of a {window:?} window")]
    RadioWedged { measured: Duration, window: Duration },

    /// Registry persistence failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A telemetry sink failed.
    #[error("Sink '{sink}' failed: {message}")]
    Sink { sink: String, message: String },
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectFailureReason {
    /// The device refused our bond; it must be paired again.
    BondingRejected,
    /// The connection attempt timed out.
    Timeout,
    /// Another connection is still held.
    Busy,
    /// No Bluetooth adapter, or it is powered off.
    AdapterUnavailable,
    /// Anything else reported by the stack.
    Other(String),
}

impl std::fmt::Display for ConnectFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BondingRejected => write!(f, "bonding rejected"),
            Self::Timeout => write!(f, "timed out"),
            Self::Busy => write!(f, "radio busy with another connection"),
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// Registry persistence errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed registry document: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a connection failure for `address`.
    pub fn connect_failed(address: impl Into<String>, reason: ConnectFailureReason) -> Self {
        Self::ConnectFailed {
            address: address.into(),
            reason,
        }
    }

    /// Create a sink failure.
    pub fn sink(sink: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Sink {
            sink: sink.into(),
            message: message.to_string(),
        }
    }

    /// Whether the process must restart. There is no in-process recovery for
    /// these.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Watchdog { .. } | Self::RadioWedged { .. })
    }

    /// Whether the device's bond is gone and it must be demoted to `NotPaired`.
    #[must_use]
    pub fn is_bonding_rejected(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed {
                reason: ConnectFailureReason::BondingRejected,
                ..
            }
        )
    }
}

/// Result type alias using blebridge-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
