//! History backfill from the Aranet4 on-board log.
//!
//! When the bridge misses samples (it was down, the device was out of range)
//! or the user explicitly asks for history, the missing records are pulled
//! from the device's log and emitted with reconstructed timestamps.
//!
//! # Protocol
//!
//! Records are fetched one parameter at a time with the SAF history V2
//! protocol: write `[0x61, param, start_lo, start_hi]` to `COMMAND`, then
//! read `HISTORY_V2`. Indices are 1-based, 1 being the oldest record.
//!
//! # Progress
//!
//! Downloads run in chunks of [`HISTORY_CHUNK`] records. After each chunk the
//! device's `pending_history` is persisted before any point is emitted, so an
//! interrupted backfill resumes with exactly the records it still lacks.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use blebridge_types::decode::{HistoryParam, HistoryResponse, decode_u16_le, zip_history};
use blebridge_types::uuid::{COMMAND, HISTORY_V2, READ_INTERVAL, SAF_SERVICE_NEW, TOTAL_READINGS};
use blebridge_types::{HistorySample, ParseError};

use crate::error::{Error, Result};
use crate::host::BleHost;
use crate::registry::Registry;
use crate::telemetry::{DeviceIdentity, Point, TelemetryDispatcher};
use crate::watchdog::{CONNECT_DEADLINE, GATT_DEADLINE, Watchdog, chunk_deadline};

/// Records downloaded per chunk.
pub const HISTORY_CHUNK: u16 = 120;

/// Interval assumed when converting hours to records for a device that has
/// never reported one.
pub const DEFAULT_INTERVAL_SECS: u16 = 300;

/// Reads of `HISTORY_V2` answering for the wrong parameter before giving up.
const MAX_PARAM_MISMATCHES: usize = 5;

/// Samples missed during a gap of `elapsed`: `floor(elapsed / interval) - 1`.
///
/// The newest sample is the current reading, so it is not counted.
pub fn pending_after_gap(elapsed: Duration, interval: u16) -> u32 {
    if interval == 0 {
        return 0;
    }
    let samples = elapsed.as_secs() / u64::from(interval);
    u32::try_from(samples.saturating_sub(1)).unwrap_or(u32::MAX)
}

/// Records covering `hours` at `interval` seconds per record.
pub fn records_for_hours(hours: u32, interval: Option<u16>) -> u32 {
    let interval = match interval {
        Some(i) if i > 0 => u64::from(i),
        _ => u64::from(DEFAULT_INTERVAL_SECS),
    };
    u32::try_from(u64::from(hours) * 3600 / interval).unwrap_or(u32::MAX)
}

/// Which log records a backfill fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillPlan {
    /// Records stored on the device.
    pub total: u16,
    /// Records to fetch, never more than `total`.
    pub count: u16,
    /// 1-based index of the oldest record to fetch.
    pub start: u16,
}

impl BackfillPlan {
    pub fn new(total: u16, requested: u32) -> Self {
        let count = u16::try_from(requested).unwrap_or(u16::MAX).min(total);
        let start = total.saturating_sub(count).max(1);
        Self { total, count, start }
    }

    /// `(start, len)` of every chunk, oldest first.
    pub fn chunks(&self) -> Vec<(u16, u16)> {
        let mut chunks = Vec::new();
        let mut offset = 0u16;
        while offset < self.count {
            let len = HISTORY_CHUNK.min(self.count - offset);
            chunks.push((self.start.saturating_add(offset), len));
            offset += len;
        }
        chunks
    }

    /// Timestamp of record `i` of the plan (0 = oldest), assuming the device
    /// logged at a constant `interval`.
    pub fn timestamp(&self, i: u16, now: OffsetDateTime, interval: u16) -> OffsetDateTime {
        let steps = i64::from(self.count.saturating_sub(i));
        now - time::Duration::seconds(steps * i64::from(interval))
    }
}

/// Result of one backfill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackfillOutcome {
    pub requested: u32,
    pub downloaded: u32,
    /// The download stopped early; the remainder stays pending.
    pub interrupted: bool,
}

/// Values of one parameter column. `error` is set when the download stopped
/// before `len` values arrived.
struct Column {
    values: Vec<u16>,
    error: Option<Error>,
}

/// Downloads and emits log records for one device at a time.
pub struct Backfill<'a> {
    host: &'a dyn BleHost,
    watchdog: &'a Watchdog,
    dispatcher: &'a TelemetryDispatcher,
    connect_deadline: Duration,
    read_deadline: Duration,
}

impl<'a> Backfill<'a> {
    pub fn new(
        host: &'a dyn BleHost,
        watchdog: &'a Watchdog,
        dispatcher: &'a TelemetryDispatcher,
    ) -> Self {
        Self {
            host,
            watchdog,
            dispatcher,
            connect_deadline: CONNECT_DEADLINE,
            read_deadline: GATT_DEADLINE,
        }
    }

    /// Watchdog deadlines for the connect and for single reads. Chunks keep
    /// their own size-based deadline.
    #[must_use]
    pub fn deadlines(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_deadline = connect;
        self.read_deadline = read;
        self
    }

    /// Fetch the device's pending records.
    ///
    /// `connected` tells whether the caller already holds a connection to
    /// this device; otherwise one is opened and left for the caller to
    /// release. A lost connection is progress, not failure: the outcome is
    /// marked interrupted and the remainder stays pending.
    ///
    /// # Errors
    ///
    /// [`Error::HistoryUnsupported`] for families without a log (their
    /// pending count is cleared), connection and watchdog failures, and
    /// registry persistence failures.
    #[instrument(skip(self, registry), fields(requested))]
    pub async fn run(
        &self,
        registry: &mut Registry,
        address: &str,
        connected: bool,
    ) -> Result<BackfillOutcome> {
        let device = registry
            .get_mut(address)
            .ok_or_else(|| Error::UnknownDevice(address.to_string()))?;
        let requested = device.pending_history;
        tracing::Span::current().record("requested", requested);
        if requested == 0 {
            return Ok(BackfillOutcome::default());
        }
        if !device.family.supports_history() {
            let family = device.family;
            device.pending_history = 0;
            registry.save()?;
            return Err(Error::HistoryUnsupported(family));
        }

        let identity = DeviceIdentity::from(&*device);
        let paired = device.is_paired();
        let fallback_interval = device.last_reading.map(|r| r.interval);
        let battery = device.last_reading.map_or(0, |r| r.battery);

        if !connected {
            self.watchdog
                .guard(
                    "history connect",
                    self.connect_deadline,
                    self.host.connect(&identity.address, paired),
                )
                .await?;
        }

        let total = self.read_u16(TOTAL_READINGS).await?;
        let interval = match self.read_u16(READ_INTERVAL).await {
            Ok(i) if i > 0 => i,
            Ok(_) | Err(Error::Decode(_) | Error::CharacteristicNotFound { .. }) => {
                fallback_interval.unwrap_or(DEFAULT_INTERVAL_SECS)
            }
            Err(e) => return Err(e),
        };
        let plan = BackfillPlan::new(total, requested);
        let planned = u32::from(plan.count);
        info!(
            "Backfilling {} of {} requested records from {} (total {}, start {})",
            plan.count, requested, identity.address, plan.total, plan.start
        );

        let now = OffsetDateTime::now_utc();
        let mut outcome = BackfillOutcome {
            requested,
            ..BackfillOutcome::default()
        };

        for (chunk_start, len) in plan.chunks() {
            let columns = self
                .watchdog
                .guard(
                    "history chunk",
                    chunk_deadline(usize::from(len)),
                    self.download_chunk(chunk_start, len),
                )
                .await?;

            let (samples, error) = columns;
            let offset = chunk_start - plan.start;
            outcome.downloaded += u32::try_from(samples.len()).unwrap_or(u32::MAX);

            if let Some(device) = registry.get_mut(&identity.address) {
                device.pending_history = planned.saturating_sub(outcome.downloaded);
            }
            registry.save()?;

            for (i, sample) in samples.into_iter().enumerate() {
                let index = offset + u16::try_from(i).unwrap_or(u16::MAX);
                let point = Point::at(
                    identity.clone(),
                    sample.into_reading(interval, battery),
                    plan.timestamp(index, now, interval),
                );
                self.dispatcher.dispatch(&point).await;
            }
            self.dispatcher.flush().await;

            if let Some(e) = error {
                warn!(
                    "History download from {} stopped after {} records: {}",
                    identity.address, outcome.downloaded, e
                );
                if e.is_fatal() {
                    return Err(e);
                }
                outcome.interrupted = true;
                return Ok(outcome);
            }
        }

        info!(
            "Backfill of {} complete: {} records",
            identity.address, outcome.downloaded
        );
        Ok(outcome)
    }

    /// Download every parameter for records `[start, start + len)` and join
    /// them into samples. Records missing any parameter are dropped.
    async fn download_chunk(
        &self,
        start: u16,
        len: u16,
    ) -> Result<(Vec<HistorySample>, Option<Error>)> {
        let mut columns: Vec<Vec<u16>> = Vec::with_capacity(HistoryParam::ARANET4.len());
        let mut stopped = None;

        for param in HistoryParam::ARANET4 {
            let column = self.download_column(param, start, len).await;
            columns.push(column.values);
            if let Some(e) = column.error {
                stopped = Some(e);
                break;
            }
        }
        columns.resize(HistoryParam::ARANET4.len(), Vec::new());

        let samples = zip_history(&columns[0], &columns[1], &columns[2], &columns[3]);
        if stopped.is_none() && samples.len() < usize::from(len) {
            debug!("Log ended {} records short", usize::from(len) - samples.len());
        }
        Ok((samples, stopped))
    }

    async fn download_column(&self, param: HistoryParam, start: u16, len: u16) -> Column {
        let wanted = usize::from(len);
        let mut values = Vec::with_capacity(wanted);
        let mut index = start;
        let mut mismatches = 0;

        while values.len() < wanted {
            let response = match self.request_values(param, index).await {
                Ok(r) => r,
                Err(e) => {
                    return Column {
                        values,
                        error: Some(e),
                    };
                }
            };
            if response.param != param as u8 {
                mismatches += 1;
                debug!("Response for param {} while reading {:?}", response.param, param);
                if mismatches >= MAX_PARAM_MISMATCHES {
                    return Column {
                        values,
                        error: Some(ParseError::UnsupportedFormat(response.param).into()),
                    };
                }
                continue;
            }
            if response.values.is_empty() {
                debug!("End of {:?} log at index {}", param, index);
                break;
            }

            let take = response.values.len().min(wanted - values.len());
            values.extend_from_slice(&response.values[..take]);
            index = response
                .start
                .saturating_add(u16::try_from(take).unwrap_or(u16::MAX));
        }

        Column {
            values,
            error: None,
        }
    }

    async fn request_values(&self, param: HistoryParam, start: u16) -> Result<HistoryResponse> {
        self.host
            .write_characteristic(SAF_SERVICE_NEW, COMMAND, &param.request(start))
            .await?;
        let data = self
            .host
            .read_characteristic(SAF_SERVICE_NEW, HISTORY_V2)
            .await?;
        Ok(HistoryResponse::parse(&data, param.value_size())?)
    }

    async fn read_u16(&self, characteristic: uuid::Uuid) -> Result<u16> {
        let data = self
            .watchdog
            .guard(
                "history read",
                self.read_deadline,
                self.host.read_characteristic(SAF_SERVICE_NEW, characteristic),
            )
            .await?;
        Ok(decode_u16_le(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::mock::{MockDevice, MockHost, RecordingSink};
    use crate::registry::{Device, MemoryStore};
    use crate::telemetry::TelemetrySink;
    use blebridge_types::Family;

    const ADDR: &str = "AA:BB:CC:DD:EE:10";

    fn samples(n: usize) -> Vec<HistorySample> {
        (0..n)
            .map(|i| HistorySample {
                co2: 400 + u16::try_from(i).unwrap(),
                temperature: 440,
                pressure: 10_100,
                humidity: 40,
            })
            .collect()
    }

    struct Fixture {
        host: MockHost,
        registry: Registry,
        store: MemoryStore,
        sink: Arc<RecordingSink>,
        dispatcher: TelemetryDispatcher,
    }

    fn fixture(family: Family, log: usize, pending: u32) -> Fixture {
        let host = MockHost::new();
        host.add_device(ADDR, MockDevice::new().with_history(60, samples(log)));
        let store = MemoryStore::new();
        let mut registry = Registry::load(store.clone()).unwrap();
        let mut device = Device::new(ADDR, "Aranet4 Lab", family);
        device.pending_history = pending;
        registry.insert(device);
        let sink = Arc::new(RecordingSink::new("rec"));
        let dispatcher = TelemetryDispatcher::new(vec![sink.clone() as Arc<dyn TelemetrySink>]);
        Fixture {
            host,
            registry,
            store,
            sink,
            dispatcher,
        }
    }

    #[test]
    fn test_pending_after_gap() {
        assert_eq!(pending_after_gap(Duration::from_secs(185), 60), 2);
        assert_eq!(pending_after_gap(Duration::from_secs(119), 60), 0);
        assert_eq!(pending_after_gap(Duration::from_secs(30), 60), 0);
        assert_eq!(pending_after_gap(Duration::from_secs(1000), 0), 0);
    }

    #[test]
    fn test_records_for_hours() {
        assert_eq!(records_for_hours(2, Some(60)), 120);
        assert_eq!(records_for_hours(1, None), 12);
        assert_eq!(records_for_hours(1, Some(0)), 12);
    }

    #[test]
    fn test_plan_clamps_to_total() {
        let plan = BackfillPlan::new(100, 250);
        assert_eq!(plan.count, 100);
        assert_eq!(plan.start, 1);

        let plan = BackfillPlan::new(100, 10);
        assert_eq!((plan.count, plan.start), (10, 90));

        let plan = BackfillPlan::new(0, 5);
        assert_eq!(plan.count, 0);
        assert!(plan.chunks().is_empty());
    }

    #[test]
    fn test_plan_chunks() {
        let plan = BackfillPlan::new(1000, 250);
        assert_eq!(plan.chunks(), vec![(750, 120), (870, 120), (990, 10)]);
    }

    #[test]
    fn test_timestamps_walk_back_from_now() {
        let plan = BackfillPlan::new(100, 3);
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(plan.timestamp(0, now, 60).unix_timestamp(), 1_700_000_000 - 180);
        assert_eq!(plan.timestamp(2, now, 60).unix_timestamp(), 1_700_000_000 - 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_backfill_emits_and_clears_pending() {
        let mut f = fixture(Family::Aranet4, 100, 250);
        let watchdog = Watchdog::default();
        let backfill = Backfill::new(&f.host, &watchdog, &f.dispatcher);

        let outcome = backfill.run(&mut f.registry, ADDR, false).await.unwrap();
        assert_eq!(
            outcome,
            BackfillOutcome {
                requested: 250,
                downloaded: 100,
                interrupted: false
            }
        );
        assert_eq!(f.registry.get(ADDR).unwrap().pending_history, 0);

        let points = f.sink.points();
        assert_eq!(points.len(), 100);
        assert_eq!(points[0].reading.measurement.co2(), Some(400));
        assert!(points.iter().all(|p| p.timestamp.is_some()));
        assert!(points[0].timestamp < points[99].timestamp);
        let first_requests = f.host.history_requests().iter().filter(|(_, start)| *start == 1).count();
        assert_eq!(first_requests, HistoryParam::ARANET4.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_read_deadline_applies() {
        let mut f = fixture(Family::Aranet4, 5, 3);
        f.host.set_read_latency(Duration::from_secs(3));
        let watchdog = Watchdog::default();

        let err = Backfill::new(&f.host, &watchdog, &f.dispatcher)
            .deadlines(CONNECT_DEADLINE, Duration::from_secs(2))
            .run(&mut f.registry, ADDR, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Watchdog { ref operation, deadline } if operation == "history read" && deadline == Duration::from_secs(2)
        ));
        assert_eq!(f.registry.get(ADDR).unwrap().pending_history, 3);

        f.host.disconnect().await.unwrap();
        let watchdog = Watchdog::default();
        let outcome = Backfill::new(&f.host, &watchdog, &f.dispatcher)
            .deadlines(CONNECT_DEADLINE, Duration::from_secs(5))
            .run(&mut f.registry, ADDR, false)
            .await
            .unwrap();
        assert_eq!(outcome.downloaded, 3);
        assert!(!watchdog.has_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_chunk_keeps_remainder_pending() {
        let mut f = fixture(Family::Aranet4, 300, 200);
        f.host.limit_history(ADDR, HistoryParam::Co2, 50);
        let watchdog = Watchdog::default();
        let backfill = Backfill::new(&f.host, &watchdog, &f.dispatcher);

        let outcome = backfill.run(&mut f.registry, ADDR, false).await.unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.downloaded, 50);
        assert_eq!(f.registry.get(ADDR).unwrap().pending_history, 150);
        assert_eq!(f.store.records()[0].pending_history, 150);
        assert_eq!(f.sink.points().len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_chunk_interrupted() {
        let mut f = fixture(Family::Aranet4, 300, 200);
        f.host.limit_history(ADDR, HistoryParam::Co2, 130);
        let watchdog = Watchdog::default();
        let backfill = Backfill::new(&f.host, &watchdog, &f.dispatcher);

        let outcome = backfill.run(&mut f.registry, ADDR, false).await.unwrap();
        assert_eq!(outcome.downloaded, 130);
        assert_eq!(f.registry.get(ADDR).unwrap().pending_history, 70);
        // One save per chunk.
        assert_eq!(f.store.save_count(), 2);
        assert_eq!(f.sink.flush_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_family_clears_pending() {
        let mut f = fixture(Family::Aranet2, 0, 20);
        let watchdog = Watchdog::default();
        let backfill = Backfill::new(&f.host, &watchdog, &f.dispatcher);

        let err = backfill.run(&mut f.registry, ADDR, false).await.unwrap_err();
        assert!(matches!(err, Error::HistoryUnsupported(Family::Aranet2)));
        assert_eq!(f.registry.get(ADDR).unwrap().pending_history, 0);
        assert_eq!(f.host.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_pending_is_noop() {
        let mut f = fixture(Family::Aranet4, 10, 0);
        let watchdog = Watchdog::default();
        let backfill = Backfill::new(&f.host, &watchdog, &f.dispatcher);

        let outcome = backfill.run(&mut f.registry, ADDR, false).await.unwrap();
        assert_eq!(outcome, BackfillOutcome::default());
        assert_eq!(f.host.connect_count(), 0);
    }
}
