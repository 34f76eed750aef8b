//! Platform-agnostic data model for the BLE telemetry bridge.
//!
//! This crate holds everything that does not need a radio: sensor families,
//! the normalized [`Reading`], UUID and manufacturer-id constants, and pure
//! decoders for advertisement and GATT payloads.
//!
//! # Example
//!
//! ```
//! use blebridge_types::{Family, decode};
//!
//! let mut beacon = vec![0x20, 0, 0, 0, 0, 0, 0, 0];
//! beacon.extend_from_slice(&[0x2F, 0x03, 0x46, 0x01, 0x94, 0x27, 45, 85, 1]);
//!
//! let reading = decode::decode_beacon(Family::Aranet4, &beacon).unwrap();
//! assert_eq!(reading.measurement.co2(), Some(815));
//! ```

pub mod decode;
pub mod error;
pub mod types;
pub mod uuid;

pub use decode::{HistoryParam, HistoryResponse, decode_beacon, decode_gatt, min_beacon_len};
pub use error::{ParseError, ParseResult};
pub use types::{Family, HistorySample, Measurement, Metric, MetricInfo, MetricValue, Reading};
