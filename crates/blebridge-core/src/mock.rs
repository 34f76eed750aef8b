//! Simulated radio for testing.
//!
//! [`MockHost`] implements [`BleHost`] without hardware. It models the
//! behaviour the acquisition pipeline depends on:
//!
//! - **Single connection**: connecting while a connection is still held or
//!   releasing fails with `Busy` and is counted as an overlap violation
//! - **Release latency**: after `disconnect` the host keeps reporting a
//!   connection for a configurable time
//! - **History log**: per-device log records served through the history V2
//!   command/response pair, in pages
//! - **Failure injection**: bond rejection, dropped history streams, wedged
//!   or failing scans, unreachable devices, slow connects and reads, and
//!   one-shot connect failures
//!
//! [`RecordingSink`] captures everything the dispatcher sends.
//!
//! # Example
//!
//! ```
//! use blebridge_core::mock::{MockDevice, MockHost};
//! use blebridge_core::BleHost;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let host = MockHost::new();
//! host.add_device("AA:BB:CC:DD:EE:FF", MockDevice::new());
//! host.connect("AA:BB:CC:DD:EE:FF", false).await.unwrap();
//! assert!(host.is_connected().await);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use blebridge_types::HistorySample;
use blebridge_types::decode::HistoryParam;
use blebridge_types::uuid::{COMMAND, HISTORY_V2, READ_INTERVAL, TOTAL_READINGS};

use crate::error::{ConnectFailureReason, Error, Result};
use crate::host::{Advertisement, BleHost, DEFAULT_CONNECT_TIMEOUT, PinSource, normalize_address};
use crate::telemetry::{DeviceIdentity, Point, TelemetrySink};

/// Values per history response when not configured otherwise.
pub const DEFAULT_HISTORY_PAGE: usize = 40;

/// A simulated peripheral.
#[derive(Debug, Clone)]
pub struct MockDevice {
    characteristics: HashMap<Uuid, Vec<u8>>,
    history: Vec<HistorySample>,
    history_interval: u16,
    history_page: usize,
    pin: Option<u32>,
    reject_bonded: bool,
    unreachable: bool,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            characteristics: HashMap::new(),
            history: Vec::new(),
            history_interval: 300,
            history_page: DEFAULT_HISTORY_PAGE,
            pin: None,
            reject_bonded: false,
            unreachable: false,
        }
    }

    /// Serve `value` for reads of `characteristic`.
    #[must_use]
    pub fn with_characteristic(mut self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.characteristics.insert(characteristic, value);
        self
    }

    /// On-board log, oldest record first. Also serves `TOTAL_READINGS` and
    /// `READ_INTERVAL`.
    #[must_use]
    pub fn with_history(mut self, interval: u16, records: Vec<HistorySample>) -> Self {
        let total = u16::try_from(records.len()).unwrap_or(u16::MAX);
        self.characteristics
            .insert(TOTAL_READINGS, total.to_le_bytes().to_vec());
        self.characteristics
            .insert(READ_INTERVAL, interval.to_le_bytes().to_vec());
        self.history = records;
        self.history_interval = interval;
        self
    }

    #[must_use]
    pub fn with_history_page(mut self, values: usize) -> Self {
        self.history_page = values.clamp(1, 255);
        self
    }

    /// Require `pin` to bond.
    #[must_use]
    pub fn with_pin(mut self, pin: u32) -> Self {
        self.pin = Some(pin);
        self
    }

    /// Refuse bonded connections, as a device that lost its bond does.
    #[must_use]
    pub fn rejecting_bond(mut self) -> Self {
        self.reject_bonded = true;
        self
    }

    /// Never answer a connect; the host gives up after its connect timeout.
    #[must_use]
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    fn column(&self, param: HistoryParam) -> Vec<u16> {
        self.history
            .iter()
            .map(|s| match param {
                HistoryParam::Temperature => s.temperature,
                HistoryParam::Humidity => u16::from(s.humidity),
                HistoryParam::Pressure => s.pressure,
                HistoryParam::Co2 => s.co2,
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct MockState {
    devices: HashMap<String, MockDevice>,
    advertisements: Vec<Advertisement>,
    connected: Option<String>,
    released_at: Option<Instant>,
    history_request: Option<(HistoryParam, u16)>,
    history_requests: Vec<(u8, u16)>,
    /// Per device: the parameter whose stream drops, and how many values
    /// it still delivers.
    history_limits: HashMap<String, (HistoryParam, usize)>,
    fail_next_connect: Option<ConnectFailureReason>,
    /// Scans left to fail.
    failing_scans: u32,
    connect_latency: Duration,
    read_latency: Duration,
    connect_timeout: Option<Duration>,
    removed_bonds: Vec<String>,
    connect_count: u32,
    overlap_violations: u32,
    reads: u32,
    scans: u32,
}

/// A [`BleHost`] backed by simulated devices.
#[derive(Debug, Default)]
pub struct MockHost {
    state: Mutex<MockState>,
    release_latency: Mutex<Duration>,
    scan_elapsed: Mutex<Option<Duration>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, address: &str, device: MockDevice) {
        self.with_state(|s| {
            s.devices.insert(normalize_address(address), device);
        });
    }

    /// Advertisements returned by every scan.
    pub fn set_advertisements(&self, advertisements: Vec<Advertisement>) {
        self.with_state(|s| s.advertisements = advertisements);
    }

    /// Replace the stored value of a characteristic.
    pub fn set_characteristic(&self, address: &str, characteristic: Uuid, value: Vec<u8>) {
        self.with_state(|s| {
            if let Some(device) = s.devices.get_mut(&normalize_address(address)) {
                device.characteristics.insert(characteristic, value);
            }
        });
    }

    /// Keep reporting a connection for `latency` after each disconnect.
    pub fn set_release_latency(&self, latency: Duration) {
        if let Ok(mut l) = self.release_latency.lock() {
            *l = latency;
        }
    }

    /// Make scans return after `elapsed` regardless of the requested window.
    pub fn set_scan_elapsed(&self, elapsed: Option<Duration>) {
        if let Ok(mut e) = self.scan_elapsed.lock() {
            *e = elapsed;
        }
    }

    /// Drop the connection once `values` values of `param` have been served
    /// from `address`'s log.
    pub fn limit_history(&self, address: &str, param: HistoryParam, values: usize) {
        self.with_state(|s| {
            s.history_limits
                .insert(normalize_address(address), (param, values));
        });
    }

    pub fn fail_next_connect(&self, reason: ConnectFailureReason) {
        self.with_state(|s| s.fail_next_connect = Some(reason));
    }

    /// Make the next `count` scans fail with a stack error.
    pub fn fail_scans(&self, count: u32) {
        self.with_state(|s| s.failing_scans = count);
    }

    /// Delay every connect by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.with_state(|s| s.connect_latency = latency);
    }

    /// Delay every characteristic read by `latency`.
    pub fn set_read_latency(&self, latency: Duration) {
        self.with_state(|s| s.read_latency = latency);
    }

    /// How long a connect to an unreachable device takes to time out.
    /// Defaults to [`DEFAULT_CONNECT_TIMEOUT`].
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.with_state(|s| s.connect_timeout = Some(timeout));
    }

    pub fn connect_count(&self) -> u32 {
        self.with_state(|s| s.connect_count)
    }

    /// Connects attempted while another connection was held or releasing.
    pub fn overlap_violations(&self) -> u32 {
        self.with_state(|s| s.overlap_violations)
    }

    pub fn read_count(&self) -> u32 {
        self.with_state(|s| s.reads)
    }

    pub fn scan_count(&self) -> u32 {
        self.with_state(|s| s.scans)
    }

    /// `(param, start)` of every history command written.
    pub fn history_requests(&self) -> Vec<(u8, u16)> {
        self.with_state(|s| s.history_requests.clone())
    }

    pub fn removed_bonds(&self) -> Vec<String> {
        self.with_state(|s| s.removed_bonds.clone())
    }

    /// Synchronous [`BleHost::is_connected`].
    pub fn is_connected_now(&self) -> bool {
        self.with_state(|s| Self::held(s, Instant::now()))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn held(state: &MockState, now: Instant) -> bool {
        state.connected.is_some() || state.released_at.is_some_and(|at| now < at)
    }

    fn latency(&self) -> Duration {
        self.release_latency
            .lock()
            .map(|l| *l)
            .unwrap_or_default()
    }

    fn drop_connection(&self, state: &mut MockState) {
        if state.connected.take().is_some() {
            state.released_at = Some(Instant::now() + self.latency());
        }
        state.history_request = None;
    }

    fn history_response(&self, state: &mut MockState, address: &str) -> Result<Vec<u8>> {
        let Some((param, start)) = state.history_request else {
            return Ok(vec![0; 10]);
        };
        let device = state
            .devices
            .get(address)
            .ok_or(Error::NotConnected)?
            .clone();

        let column = device.column(param);
        let first = usize::from(start.max(1)) - 1;
        let mut count = column
            .len()
            .saturating_sub(first)
            .min(device.history_page);

        let mut exhausted = false;
        if let Some((limited, remaining)) = state.history_limits.get_mut(address)
            && *limited == param
        {
            exhausted = *remaining == 0;
            count = count.min(*remaining);
            *remaining -= count;
        }
        if exhausted {
            self.drop_connection(state);
            return Err(Error::NotConnected);
        }

        let total = u16::try_from(column.len()).unwrap_or(u16::MAX);
        let mut out = Vec::with_capacity(10 + count * 2);
        out.push(param as u8);
        out.extend_from_slice(&device.history_interval.to_le_bytes());
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&start.to_le_bytes());
        out.push(u8::try_from(count).unwrap_or(u8::MAX));
        for value in column.iter().skip(first).take(count) {
            if param.value_size() == 1 {
                out.push(u8::try_from(*value).unwrap_or(u8::MAX));
            } else {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Ok(out)
    }
}

fn history_param(byte: u8) -> Option<HistoryParam> {
    HistoryParam::ARANET4.into_iter().find(|p| *p as u8 == byte)
}

#[async_trait]
impl BleHost for MockHost {
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>> {
        let elapsed = self
            .scan_elapsed
            .lock()
            .ok()
            .and_then(|e| *e)
            .unwrap_or(duration);
        let failing = self.with_state(|s| {
            s.scans += 1;
            if s.failing_scans > 0 {
                s.failing_scans -= 1;
                true
            } else {
                false
            }
        });
        if failing {
            return Err(Error::Bluetooth(btleplug::Error::RuntimeError(
                "adapter not responding".into(),
            )));
        }
        tokio::time::sleep(elapsed).await;
        Ok(self.with_state(|s| s.advertisements.clone()))
    }

    async fn connect(&self, address: &str, bonded: bool) -> Result<()> {
        let address = normalize_address(address);
        let (latency, unreachable) = self.with_state(|s| {
            if Self::held(s, Instant::now()) {
                s.overlap_violations += 1;
                return Err(Error::connect_failed(&address, ConnectFailureReason::Busy));
            }
            let unreachable = s.devices.get(&address).is_some_and(|d| d.unreachable);
            let timeout = s.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
            Ok(if unreachable {
                (timeout, true)
            } else {
                (s.connect_latency, false)
            })
        })?;
        tokio::time::sleep(latency).await;
        if unreachable {
            return Err(Error::connect_failed(&address, ConnectFailureReason::Timeout));
        }

        self.with_state(|s| {
            if let Some(reason) = s.fail_next_connect.take() {
                return Err(Error::connect_failed(&address, reason));
            }
            let device = s.devices.get(&address).ok_or_else(|| {
                Error::connect_failed(&address, ConnectFailureReason::Other("out of range".into()))
            })?;
            if bonded && device.reject_bonded {
                return Err(Error::connect_failed(
                    &address,
                    ConnectFailureReason::BondingRejected,
                ));
            }
            s.connect_count += 1;
            s.connected = Some(address.clone());
            Ok(())
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.with_state(|s| self.drop_connection(s));
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.is_connected_now()
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let latency = self.with_state(|s| s.read_latency);
        tokio::time::sleep(latency).await;
        self.with_state(|s| {
            let address = s.connected.clone().ok_or(Error::NotConnected)?;
            s.reads += 1;
            if characteristic == HISTORY_V2 {
                return self.history_response(s, &address);
            }
            s.devices
                .get(&address)
                .and_then(|d| d.characteristics.get(&characteristic))
                .cloned()
                .ok_or(Error::CharacteristicNotFound {
                    service,
                    characteristic,
                })
        })
    }

    async fn write_characteristic(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        self.with_state(|s| {
            let address = s.connected.clone().ok_or(Error::NotConnected)?;
            if characteristic == COMMAND
                && let [0x61, param, lo, hi] = *data
            {
                let start = u16::from_le_bytes([lo, hi]);
                s.history_requests.push((param, start));
                s.history_request = history_param(param).map(|p| (p, start));
                return Ok(());
            }
            if let Some(device) = s.devices.get_mut(&address) {
                device.characteristics.insert(characteristic, data.to_vec());
            }
            Ok(())
        })
    }

    async fn request_bonding(&self, pins: &dyn PinSource) -> Result<()> {
        let (address, expected) = self.with_state(|s| {
            let address = s.connected.clone().ok_or(Error::NotConnected)?;
            let expected = s.devices.get(&address).and_then(|d| d.pin);
            Ok::<_, Error>((address, expected))
        })?;
        let Some(expected) = expected else {
            return Ok(());
        };
        match pins.request_pin().await {
            Some(pin) if pin == expected => Ok(()),
            _ => Err(Error::connect_failed(
                address,
                ConnectFailureReason::BondingRejected,
            )),
        }
    }

    async fn remove_bond(&self, address: &str) -> Result<()> {
        let address = normalize_address(address);
        self.with_state(|s| {
            if let Some(device) = s.devices.get_mut(&address) {
                device.reject_bonded = false;
            }
            s.removed_bonds.push(address);
        });
        Ok(())
    }
}

/// A [`TelemetrySink`] that records what it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    name: String,
    announced: Mutex<Vec<DeviceIdentity>>,
    points: Mutex<Vec<Point>>,
    flushes: Mutex<usize>,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn announced(&self) -> Vec<DeviceIdentity> {
        self.announced.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().map(|f| *f).unwrap_or(0)
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn announce(&self, device: &DeviceIdentity) -> Result<()> {
        if let Ok(mut announced) = self.announced.lock() {
            announced.push(device.clone());
        }
        Ok(())
    }

    async fn write(&self, point: &Point) -> Result<()> {
        if let Ok(mut points) = self.points.lock() {
            points.push(point.clone());
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if let Ok(mut flushes) = self.flushes.lock() {
            *flushes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blebridge_types::decode::HistoryResponse;
    use blebridge_types::uuid::SAF_SERVICE_NEW;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    #[tokio::test(start_paused = true)]
    async fn test_release_latency_blocks_next_connect() {
        let host = MockHost::new();
        host.add_device(ADDR, MockDevice::new());
        host.set_release_latency(Duration::from_millis(500));

        host.connect(ADDR, false).await.unwrap();
        host.disconnect().await.unwrap();
        assert!(host.is_connected().await);
        assert!(host.connect(ADDR, false).await.is_err());
        assert_eq!(host.overlap_violations(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!host.is_connected().await);
        host.connect(ADDR, false).await.unwrap();
        assert_eq!(host.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_reads_require_connection() {
        let host = MockHost::new();
        host.add_device(
            ADDR,
            MockDevice::new().with_characteristic(READ_INTERVAL, vec![60, 0]),
        );
        assert!(matches!(
            host.read_characteristic(SAF_SERVICE_NEW, READ_INTERVAL).await,
            Err(Error::NotConnected)
        ));
        host.connect(ADDR, false).await.unwrap();
        assert_eq!(
            host.read_characteristic(SAF_SERVICE_NEW, READ_INTERVAL)
                .await
                .unwrap(),
            vec![60, 0]
        );
    }

    #[tokio::test]
    async fn test_history_pages() {
        let host = MockHost::new();
        let records = (0..5)
            .map(|i| HistorySample {
                co2: 500 + i,
                temperature: 400,
                pressure: 10_000,
                humidity: 45,
            })
            .collect();
        host.add_device(
            ADDR,
            MockDevice::new().with_history(60, records).with_history_page(2),
        );
        host.connect(ADDR, false).await.unwrap();

        host.write_characteristic(SAF_SERVICE_NEW, COMMAND, &HistoryParam::Co2.request(4))
            .await
            .unwrap();
        let raw = host
            .read_characteristic(SAF_SERVICE_NEW, HISTORY_V2)
            .await
            .unwrap();
        let response = HistoryResponse::parse(&raw, 2).unwrap();
        assert_eq!(response.total, 5);
        assert_eq!(response.start, 4);
        assert_eq!(response.values, vec![503, 504]);

        host.write_characteristic(SAF_SERVICE_NEW, COMMAND, &HistoryParam::Humidity.request(5))
            .await
            .unwrap();
        let raw = host
            .read_characteristic(SAF_SERVICE_NEW, HISTORY_V2)
            .await
            .unwrap();
        assert_eq!(HistoryResponse::parse(&raw, 1).unwrap().values, vec![45]);
    }

    #[tokio::test]
    async fn test_bond_rejection() {
        let host = MockHost::new();
        host.add_device(ADDR, MockDevice::new().rejecting_bond());
        let err = host.connect(ADDR, true).await.unwrap_err();
        assert!(err.is_bonding_rejected());
        host.connect(ADDR, false).await.unwrap();
    }
}
