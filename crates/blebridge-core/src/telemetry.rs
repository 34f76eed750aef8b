//! Fan-out of readings to telemetry sinks.
//!
//! Sinks buffer on their own and only push data out on [`TelemetrySink::flush`].
//! The dispatcher isolates sinks from each other and from acquisition: a
//! failing sink is logged and skipped, never retried and never surfaced to
//! the scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use time::OffsetDateTime;
use tracing::{debug, warn};

use blebridge_types::{Family, Reading};

use crate::error::Result;
use crate::registry::Device;

/// Default bound on one sink's flush.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Who a point belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub address: String,
    pub name: String,
    pub family: Family,
}

impl From<&Device> for DeviceIdentity {
    fn from(device: &Device) -> Self {
        Self {
            address: device.address.clone(),
            name: device.name.clone(),
            family: device.family,
        }
    }
}

/// One reading on its way to the sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub device: DeviceIdentity,
    pub reading: Reading,
    /// Wall-clock time of a historical sample; `None` means "now".
    pub timestamp: Option<OffsetDateTime>,
}

impl Point {
    pub fn live(device: DeviceIdentity, reading: Reading) -> Self {
        Self {
            device,
            reading,
            timestamp: None,
        }
    }

    pub fn at(device: DeviceIdentity, reading: Reading, timestamp: OffsetDateTime) -> Self {
        Self {
            device,
            reading,
            timestamp: Some(timestamp),
        }
    }
}

/// A destination for readings.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// One-time registration of a device, sent before its first point.
    async fn announce(&self, device: &DeviceIdentity) -> Result<()>;

    /// Queue one point.
    async fn write(&self, point: &Point) -> Result<()>;

    /// Push queued points out.
    async fn flush(&self) -> Result<()>;
}

/// Delivers points to every configured sink.
#[derive(Clone)]
pub struct TelemetryDispatcher {
    sinks: Vec<Arc<dyn TelemetrySink>>,
    flush_timeout: Duration,
}

impl std::fmt::Debug for TelemetryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryDispatcher")
            .field(
                "sinks",
                &self.sinks.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("flush_timeout", &self.flush_timeout)
            .finish()
    }
}

impl Default for TelemetryDispatcher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl TelemetryDispatcher {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self {
            sinks,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    pub fn sinks(&self) -> &[Arc<dyn TelemetrySink>] {
        &self.sinks
    }

    pub async fn announce(&self, device: &DeviceIdentity) {
        for sink in &self.sinks {
            if let Err(e) = sink.announce(device).await {
                warn!("{}: announcing {} failed: {}", sink.name(), device.address, e);
            }
        }
    }

    pub async fn dispatch(&self, point: &Point) {
        debug!(
            "Dispatching {} reading for {}",
            point.reading.family, point.device.address
        );
        for sink in &self.sinks {
            if let Err(e) = sink.write(point).await {
                warn!("{}: dropping point for {}: {}", sink.name(), point.device.address, e);
            }
        }
    }

    /// Flush every sink concurrently, each bounded by the flush timeout.
    pub async fn flush(&self) {
        let flushes = self.sinks.iter().map(|sink| async move {
            match tokio::time::timeout(self.flush_timeout, sink.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("{}: flush failed: {}", sink.name(), e),
                Err(_) => warn!(
                    "{}: flush timed out after {:?}",
                    sink.name(),
                    self.flush_timeout
                ),
            }
        });
        join_all(flushes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mock::RecordingSink;
    use blebridge_types::Measurement;

    struct FailingSink;

    #[async_trait]
    impl TelemetrySink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }
        async fn announce(&self, _: &DeviceIdentity) -> Result<()> {
            Err(Error::sink("failing", "down"))
        }
        async fn write(&self, _: &Point) -> Result<()> {
            Err(Error::sink("failing", "down"))
        }
        async fn flush(&self) -> Result<()> {
            Err(Error::sink("failing", "down"))
        }
    }

    struct StuckSink;

    #[async_trait]
    impl TelemetrySink for StuckSink {
        fn name(&self) -> &str {
            "stuck"
        }
        async fn announce(&self, _: &DeviceIdentity) -> Result<()> {
            Ok(())
        }
        async fn write(&self, _: &Point) -> Result<()> {
            Ok(())
        }
        async fn flush(&self) -> Result<()> {
            std::future::pending().await
        }
    }

    fn point() -> Point {
        Point::live(
            DeviceIdentity {
                address: "AA".into(),
                name: "Aranet2 Office".into(),
                family: Family::Aranet2,
            },
            Reading {
                family: Family::Aranet2,
                measurement: Measurement::Ambient {
                    temperature: 2150,
                    humidity: 455,
                },
                battery: 88,
                interval: 300,
                age: 12,
            },
        )
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let recorder = Arc::new(RecordingSink::new("recorder"));
        let dispatcher = TelemetryDispatcher::new(vec![
            Arc::new(FailingSink),
            recorder.clone() as Arc<dyn TelemetrySink>,
        ]);

        let p = point();
        dispatcher.announce(&p.device).await;
        dispatcher.dispatch(&p).await;
        dispatcher.flush().await;

        assert_eq!(recorder.announced().len(), 1);
        assert_eq!(recorder.points(), vec![p]);
        assert_eq!(recorder.flush_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_is_bounded() {
        let recorder = Arc::new(RecordingSink::new("recorder"));
        let dispatcher = TelemetryDispatcher::new(vec![
            Arc::new(StuckSink),
            recorder.clone() as Arc<dyn TelemetrySink>,
        ])
        .with_flush_timeout(Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        dispatcher.flush().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(recorder.flush_count(), 1);
    }
}
