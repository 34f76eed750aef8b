//! Acquisition pipeline of the BLE telemetry bridge.
//!
//! This crate turns what a single Bluetooth radio hears into telemetry
//! points: it classifies advertisements, decodes beacons, connects when a
//! beacon is not enough, backfills missed samples from on-board logs,
//! drives device pairing and keeps the set of registered devices on disk.
//!
//! # Supported Devices
//!
//! | Device | Beacon | GATT | History |
//! |--------|--------|------|---------|
//! | Aranet4 | yes | yes | yes |
//! | Aranet2 | yes | yes | no |
//! | Aranet Radiation | yes | yes | no |
//! | Airvalent | no | yes | no |
//! | Ruuvi-compatible beacon tag | yes | no | no |
//!
//! # Architecture
//!
//! - [`BleHost`] is the only way to the radio; [`BtleplugHost`] drives a
//!   real adapter and [`mock::MockHost`] simulates one.
//! - [`Scheduler`] owns the [`Registry`], the [`ScanCache`] and the
//!   [`TelemetryDispatcher`] and runs one acquisition cycle at a time.
//! - [`Watchdog`] bounds every radio operation; expiry is fatal.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use blebridge_core::{
//!     BtleplugHost, JsonFileStore, Registry, Scheduler, SchedulerConfig, TelemetryDispatcher,
//!     Watchdog,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = Arc::new(BtleplugHost::new().await?);
//!     let registry = Registry::load(JsonFileStore::new("devices.json"))?;
//!     let mut scheduler = Scheduler::new(
//!         host,
//!         registry,
//!         TelemetryDispatcher::default(),
//!         Watchdog::default(),
//!         SchedulerConfig::default(),
//!     );
//!
//!     loop {
//!         let report = scheduler.run_cycle().await?;
//!         println!("{} readings", report.acquired);
//!     }
//! }
//! ```

pub mod btle;
pub mod classifier;
pub mod error;
pub mod history;
pub mod host;
pub mod mock;
pub mod pairing;
pub mod registry;
pub mod scan_cache;
pub mod scheduler;
pub mod telemetry;
pub mod watchdog;

pub use blebridge_types::{Family, Measurement, Reading, types, uuid};

pub use btle::BtleplugHost;
pub use classifier::{Classification, classify};
pub use error::{ConnectFailureReason, Error, RegistryError, Result};
pub use history::{BackfillOutcome, BackfillPlan, HISTORY_CHUNK, pending_after_gap};
pub use host::{Advertisement, BleHost, DEFAULT_CONNECT_TIMEOUT, PinSource, normalize_address};
pub use pairing::{PairingFlow, PairingPinSource, PinHandle};
pub use registry::{
    Device, DeviceFlags, DeviceRecord, JsonFileStore, MemoryStore, PairingState, Registry,
    RegistryStore,
};
pub use scan_cache::{ScanCache, ScanCacheEntry};
pub use scheduler::{CycleReport, HistoryRequest, Scheduler, SchedulerConfig};
pub use telemetry::{DeviceIdentity, Point, TelemetryDispatcher, TelemetrySink};
pub use watchdog::{CONNECT_DEADLINE, GATT_DEADLINE, Watchdog, WatchdogGuard};
