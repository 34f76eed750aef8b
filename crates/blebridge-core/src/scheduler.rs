//! The acquisition cycle.
//!
//! One [`Scheduler`] owns the registry, the scan cache and the telemetry
//! dispatcher, and is driven from a single task. Each call to
//! [`Scheduler::run_cycle`]:
//!
//! 1. runs a queued pairing flow, if any,
//! 2. scans for `scan_window`, treating a scan that returns too early, or
//!    [`SchedulerConfig::max_scan_failures`] failed scans in a row, as a
//!    wedged radio,
//! 3. classifies what it heard and decides, per registered device, whether a
//!    reading or a history catch-up is due,
//! 4. acquires each due device in turn, preferring the advertisement over a
//!    connection and always releasing the radio before the next one,
//! 5. evicts stale scan cache entries and flushes the sinks.
//!
//! The radio is never shared: before each device the scheduler waits
//! (bounded) for the previous connection to be released and skips the
//! device if it is not.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use blebridge_types::decode::{decode_beacon, decode_gatt, decode_u16_le};
use blebridge_types::uuid::{AIRVALENT_INTERVAL, AIRVALENT_SERVICE, SAF_SERVICE_NEW, SECONDS_SINCE_UPDATE};
use blebridge_types::{Family, Reading};

use crate::classifier::{Classification, classify};
use crate::error::{Error, Result};
use crate::history::{Backfill, pending_after_gap, records_for_hours};
use crate::host::{Advertisement, BleHost, normalize_address, wait_for_release};
use crate::pairing::{DEFAULT_PIN_TIMEOUT, PairingFlow, PinHandle};
use crate::registry::{Device, DeviceFlags, PairingState, Registry};
use crate::scan_cache::{DEFAULT_SCAN_CACHE_TTL, ScanCache, ScanCacheEntry};
use crate::telemetry::{DeviceIdentity, Point, TelemetryDispatcher};
use crate::watchdog::{CONNECT_DEADLINE, GATT_DEADLINE, Watchdog};

/// Fraction of the scan window a scan must last to count as healthy.
const MIN_SCAN_FRACTION: f64 = 0.9;

/// Failed scans in a row after which the radio counts as wedged.
pub const DEFAULT_MAX_SCAN_FAILURES: u32 = 3;

/// Timing of the acquisition cycle.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub scan_window: Duration,
    /// Bounded wait for the previous connection to be released.
    pub release_wait: Duration,
    pub connect_deadline: Duration,
    pub read_deadline: Duration,
    /// Deadline of a whole cycle.
    pub cycle_deadline: Duration,
    pub cache_ttl: Duration,
    pub pairing_timeout: Duration,
    /// Consecutive failed scans tolerated before the radio counts as wedged.
    pub max_scan_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(5),
            release_wait: Duration::from_secs(1),
            connect_deadline: CONNECT_DEADLINE,
            read_deadline: GATT_DEADLINE,
            cycle_deadline: Duration::from_secs(300),
            cache_ttl: DEFAULT_SCAN_CACHE_TTL,
            pairing_timeout: DEFAULT_PIN_TIMEOUT,
            max_scan_failures: DEFAULT_MAX_SCAN_FAILURES,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Advertisements heard.
    pub heard: usize,
    /// Devices whose reading was dispatched.
    pub acquired: usize,
    /// Due devices skipped because the radio was still held.
    pub skipped: usize,
    /// Due devices whose acquisition failed.
    pub failed: usize,
    /// History records downloaded.
    pub backfilled: u32,
    /// Scan cache entries evicted.
    pub evicted: usize,
    /// Outcome of a pairing flow run during the cycle.
    pub pairing: Option<PairingState>,
}

/// How much history to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRequest {
    Records(u32),
    /// Converted to records with the device's last known interval.
    Hours(u32),
}

/// Work decided for one registered device.
#[derive(Debug, Clone)]
struct Due {
    address: String,
    beacon: Option<Vec<u8>>,
    read_now: bool,
}

/// Drives the radio and owns all device state.
pub struct Scheduler {
    host: Arc<dyn BleHost>,
    registry: Registry,
    cache: ScanCache,
    dispatcher: TelemetryDispatcher,
    watchdog: Watchdog,
    pairing: PairingFlow,
    config: SchedulerConfig,
    scan_failures: u32,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        host: Arc<dyn BleHost>,
        registry: Registry,
        dispatcher: TelemetryDispatcher,
        watchdog: Watchdog,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            host,
            registry,
            cache: ScanCache::new(config.cache_ttl),
            dispatcher,
            watchdog,
            pairing: PairingFlow::new(config.pairing_timeout),
            config,
            scan_failures: 0,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &TelemetryDispatcher {
        &self.dispatcher
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one acquisition cycle.
    ///
    /// # Errors
    ///
    /// [`Error::RadioWedged`] and [`Error::Watchdog`], which end the process;
    /// a failed scan, until too many fail in a row; and registry persistence
    /// failures. Per-device failures are logged and counted in the report.
    #[instrument(skip(self))]
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let _cycle = self.watchdog.arm("cycle", self.config.cycle_deadline);
        let mut report = CycleReport {
            pairing: self.run_pending_pairing().await?,
            ..CycleReport::default()
        };

        let window = self.config.scan_window;
        let started = Instant::now();
        let heard = match self.host.scan(window).await {
            Ok(heard) => {
                self.scan_failures = 0;
                heard
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.scan_failures += 1;
                if self.scan_failures >= self.config.max_scan_failures {
                    warn!("{} scans in a row failed, last: {}", self.scan_failures, e);
                    self.dispatcher.flush().await;
                    return Err(Error::RadioWedged {
                        measured: started.elapsed(),
                        window,
                    });
                }
                return Err(e);
            }
        };
        let measured = started.elapsed();
        if measured < window.mul_f64(MIN_SCAN_FRACTION) {
            self.dispatcher.flush().await;
            return Err(Error::RadioWedged { measured, window });
        }
        report.heard = heard.len();

        let now = Instant::now();
        let due: Vec<Due> = heard
            .iter()
            .filter_map(|adv| self.observe(adv, classify(adv), now))
            .collect();
        debug!("Heard {} advertisements, {} devices due", heard.len(), due.len());

        for task in due {
            self.acquire(task, &mut report).await?;
        }

        report.evicted = self.cache.evict_expired(Instant::now()).len();
        self.dispatcher.flush().await;
        info!(
            "Cycle done: {} read, {} skipped, {} failed, {} history records",
            report.acquired, report.skipped, report.failed, report.backfilled
        );
        Ok(report)
    }

    /// Apply one advertisement to the cache or the registry and decide
    /// whether the device is due.
    fn observe(&mut self, adv: &Advertisement, class: Classification<'_>, now: Instant) -> Option<Due> {
        let Some(device) = self.registry.get_mut(&adv.address) else {
            self.cache
                .observe(&adv.address, adv.name.as_deref(), class.family, adv.rssi, now);
            return None;
        };

        if adv.rssi.is_some() {
            device.rssi = adv.rssi;
        }
        device.last_seen = Some(now);
        if device.family == Family::Unknown && class.family != Family::Unknown {
            device.family = class.family;
        }
        if !device.flags.enabled {
            return None;
        }

        let read_now = device.expected_next().is_none_or(|next| now >= next);
        let read_history = device.flags.history_enabled && device.pending_history > 0;
        if !read_now && !read_history {
            return None;
        }
        Some(Due {
            address: device.address.clone(),
            beacon: class.beacon.map(<[u8]>::to_vec),
            read_now,
        })
    }

    async fn acquire(&mut self, task: Due, report: &mut CycleReport) -> Result<()> {
        let host = Arc::clone(&self.host);
        if !wait_for_release(host.as_ref(), self.config.release_wait).await {
            debug!("Radio still held, skipping {} this cycle", task.address);
            report.skipped += 1;
            return Ok(());
        }

        let outcome = self.acquire_device(&task, report).await;

        if let Err(e) = host.disconnect().await {
            warn!("Failed to release {}: {}", task.address, e);
        }
        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Acquisition of {} failed: {}", task.address, e);
                report.failed += 1;
                Ok(())
            }
        }
    }

    #[instrument(skip(self, task, report), fields(address = %task.address))]
    async fn acquire_device(&mut self, task: &Due, report: &mut CycleReport) -> Result<()> {
        let (family, gatt_allowed, paired) = match self.registry.get(&task.address) {
            Some(d) => (d.family, d.flags.gatt_allowed, d.is_paired()),
            None => return Ok(()),
        };
        let mut connected = false;

        let mut reading = None;
        if task.read_now {
            if let Some(beacon) = &task.beacon {
                match decode_beacon(family, beacon) {
                    Ok(r) => reading = Some(r),
                    Err(e) => debug!("Beacon from {} not usable: {}", task.address, e),
                }
            }
            if reading.is_none() && gatt_allowed && family.has_gatt() {
                match self.read_gatt(&task.address, family, paired, &mut connected).await {
                    Ok(r) => reading = Some(r),
                    Err(e) if e.is_bonding_rejected() => {
                        if let Some(device) = self.registry.get_mut(&task.address) {
                            device.pairing = PairingState::NotPaired;
                        }
                        self.registry.save()?;
                        warn!("{} rejected our bond; marked not paired", task.address);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let Some(device) = self.registry.get_mut(&task.address) else {
            return Ok(());
        };
        if let Some(r) = reading {
            let now = Instant::now();
            if device.flags.history_enabled
                && device.pending_history == 0
                && let Some(previous) = device.last_updated
            {
                device.pending_history = pending_after_gap(now - previous, r.interval);
                if device.pending_history > 0 {
                    debug!("{} missed {} samples", task.address, device.pending_history);
                }
            }
            device.last_reading = Some(r);
            device.last_updated = Some(now);
        }
        let identity = DeviceIdentity::from(&*device);
        let announce = !device.sink_config_sent && (reading.is_some() || device.pending_history > 0);
        let backfill_due = device.flags.history_enabled && device.pending_history > 0;

        if announce {
            self.dispatcher.announce(&identity).await;
            if let Some(device) = self.registry.get_mut(&task.address) {
                device.sink_config_sent = true;
            }
        }

        let backfill = if backfill_due {
            Some(
                Backfill::new(self.host.as_ref(), &self.watchdog, &self.dispatcher)
                    .deadlines(self.config.connect_deadline, self.config.read_deadline)
                    .run(&mut self.registry, &task.address, connected)
                    .await,
            )
        } else {
            None
        };

        if let Some(r) = reading {
            self.dispatcher.dispatch(&Point::live(identity, r)).await;
            report.acquired += 1;
        }

        match backfill {
            Some(Ok(outcome)) => report.backfilled += outcome.downloaded,
            Some(Err(Error::HistoryUnsupported(family))) => {
                warn!("{} ({}) keeps no history; request dropped", task.address, family);
            }
            Some(Err(e)) => return Err(e),
            None => {}
        }
        Ok(())
    }

    /// Connect and read the current values over GATT.
    async fn read_gatt(
        &self,
        address: &str,
        family: Family,
        bonded: bool,
        connected: &mut bool,
    ) -> Result<Reading> {
        let (Some(service), Some(characteristic)) =
            (family.readings_service(), family.readings_characteristic())
        else {
            return Err(Error::Decode(blebridge_types::ParseError::UnsupportedFormat(0)));
        };

        self.watchdog
            .guard(
                "connect",
                self.config.connect_deadline,
                self.host.connect(address, bonded),
            )
            .await?;
        *connected = true;

        let raw = self.read(service, characteristic).await?;
        let mut reading = decode_gatt(family, &raw)?;

        match family {
            Family::Aranet2 => match self.read_u16(SAF_SERVICE_NEW, SECONDS_SINCE_UPDATE).await {
                Ok(age) => reading.age = age,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("No age from {}: {}", address, e),
            },
            Family::Airvalent => match self.read_u16(AIRVALENT_SERVICE, AIRVALENT_INTERVAL).await {
                Ok(interval) => reading.interval = interval,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("No interval from {}: {}", address, e),
            },
            _ => {}
        }
        Ok(reading)
    }

    async fn read(&self, service: uuid::Uuid, characteristic: uuid::Uuid) -> Result<Vec<u8>> {
        self.watchdog
            .guard(
                "read",
                self.config.read_deadline,
                self.host.read_characteristic(service, characteristic),
            )
            .await
    }

    async fn read_u16(&self, service: uuid::Uuid, characteristic: uuid::Uuid) -> Result<u16> {
        let raw = self.read(service, characteristic).await?;
        Ok(decode_u16_le(&raw)?)
    }

    /// Run the queued pairing flow, if any.
    pub async fn run_pending_pairing(&mut self) -> Result<Option<PairingState>> {
        self.pairing
            .run(
                self.host.as_ref(),
                &mut self.registry,
                &self.watchdog,
                self.config.release_wait,
            )
            .await
    }

    /// Scan once and record what was heard, without acquiring anything.
    pub async fn observe_scan(&mut self) -> Result<Vec<(Advertisement, Family)>> {
        let heard = self.host.scan(self.config.scan_window).await?;
        let now = Instant::now();
        let mut out = Vec::with_capacity(heard.len());
        for adv in heard {
            let family = classify(&adv).family;
            if let Some(device) = self.registry.get_mut(&adv.address) {
                device.rssi = adv.rssi.or(device.rssi);
                device.last_seen = Some(now);
            } else {
                self.cache
                    .observe(&adv.address, adv.name.as_deref(), family, adv.rssi, now);
            }
            out.push((adv, family));
        }
        Ok(out)
    }

    pub fn list_devices(&self) -> Vec<&Device> {
        self.registry.iter().collect()
    }

    pub fn list_scanned(&self) -> Vec<&ScanCacheEntry> {
        self.cache.entries()
    }

    /// Promote a recently heard device into the registry.
    ///
    /// Adding an already registered device is a no-op.
    pub fn add_device(&mut self, address: &str) -> Result<&Device> {
        let address = normalize_address(address);
        if !self.registry.contains(&address) {
            let entry = self
                .cache
                .remove(&address)
                .ok_or_else(|| Error::UnknownDevice(address.clone()))?;
            let name = entry.name.as_deref().unwrap_or_default();
            let device = Device::new(&address, name, entry.family.unwrap_or_default());
            info!("Registered {} ({}, {})", address, device.name, device.family);
            self.registry.insert(device);
            self.registry.save()?;
        }
        self.registry
            .get(&address)
            .ok_or(Error::UnknownDevice(address))
    }

    /// Unregister a device and drop its bond.
    pub async fn remove_device(&mut self, address: &str) -> Result<Device> {
        let address = normalize_address(address);
        let device = self
            .registry
            .remove(&address)
            .ok_or_else(|| Error::UnknownDevice(address.clone()))?;
        if let Err(e) = self.host.remove_bond(&address).await {
            warn!("Failed to remove bond of {}: {}", address, e);
        }
        self.registry.save()?;
        info!("Removed {}", address);
        Ok(device)
    }

    pub fn set_flags(&mut self, address: &str, flags: DeviceFlags) -> Result<()> {
        let device = self
            .registry
            .get_mut(address)
            .ok_or_else(|| Error::UnknownDevice(normalize_address(address)))?;
        device.flags = flags;
        debug!("{} flags now {:?}", device.address, flags);
        self.registry.save()
    }

    /// Ask for history records; they are fetched on the next cycle the
    /// device is heard. Returns the number of records requested.
    pub fn request_history(&mut self, address: &str, request: HistoryRequest) -> Result<u32> {
        let device = self
            .registry
            .get_mut(address)
            .ok_or_else(|| Error::UnknownDevice(normalize_address(address)))?;
        if !device.family.supports_history() {
            return Err(Error::HistoryUnsupported(device.family));
        }
        let records = match request {
            HistoryRequest::Records(n) => n,
            HistoryRequest::Hours(h) => {
                records_for_hours(h, device.last_reading.map(|r| r.interval))
            }
        };
        device.pending_history = records;
        if !device.flags.history_enabled {
            warn!(
                "History is disabled for {}; the request waits until it is enabled",
                device.address
            );
        }
        self.registry.save()?;
        Ok(records)
    }

    pub fn request_pairing(&mut self, address: &str) -> Result<()> {
        self.pairing.request(&mut self.registry, address)
    }

    pub async fn unpair(&mut self, address: &str) -> Result<()> {
        self.pairing
            .unpair(self.host.as_ref(), &mut self.registry, address)
            .await
    }

    /// Handle for delivering a PIN from another task.
    pub fn pin_handle(&self) -> PinHandle {
        self.pairing.handle()
    }
}
