//! InfluxDB sink.
//!
//! Points are rendered to line protocol as they arrive and held in a bounded
//! buffer; [`TelemetrySink::flush`] writes them out in batches over HTTP.
//!
//! # Line Format
//!
//! ```text
//! aranet,device=attic,name=Aranet4\ 1A2B3 co2=815i,temperature=16.3,...,interval=60i,ago=5i 1760000000
//! ```
//!
//! The measurement is `aranet` for SAF devices, `airvalent` for Airvalent and
//! `beacon` for beacon tags. Tags are the bridge name and the device name.
//! Historical points carry their reconstructed timestamp (seconds); live
//! points leave it to the server.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use blebridge_core::{DeviceIdentity, Error, Family, Point, Result, TelemetrySink};
use blebridge_types::MetricValue;

use crate::config::{InfluxConfig, InfluxVersion};

const SINK_NAME: &str = "influx";

/// Field values for InfluxDB line protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(num) => write!(f, "{num}i"),
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::String(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        }
    }
}

impl From<MetricValue> for FieldValue {
    fn from(value: MetricValue) -> Self {
        match value {
            MetricValue::Int(v) => FieldValue::Integer(v),
            MetricValue::Float(v) => FieldValue::Float(v),
        }
    }
}

/// Data point in InfluxDB line protocol.
#[derive(Debug, Clone)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<i64>,
}

/// Escape commas and spaces (measurement), plus equals signs (tags, keys).
fn escape(s: &str, equals: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == ',' || c == ' ' || (equals && c == '=') || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", escape(&self.measurement, false))?;
        for (key, value) in &self.tag_set {
            write!(f, ",{}={}", escape(key, true), escape(value, true))?;
        }
        let mut first = true;
        for (key, value) in &self.field_set {
            write!(f, "{}{}={}", if first { " " } else { "," }, escape(key, true), value)?;
            first = false;
        }
        if let Some(ts) = self.timestamp {
            write!(f, " {ts}")?;
        }
        Ok(())
    }
}

/// Measurement name for a family.
pub fn measurement(family: Family) -> &'static str {
    match family {
        Family::Airvalent => "airvalent",
        Family::BeaconTag => "beacon",
        _ => "aranet",
    }
}

/// Render a point for the bridge named `bridge`.
pub fn data_point(bridge: &str, point: &Point) -> DataPoint {
    let mut tag_set = BTreeMap::new();
    tag_set.insert("device".to_string(), bridge.to_string());
    let name = if point.device.name.is_empty() {
        &point.device.address
    } else {
        &point.device.name
    };
    tag_set.insert("name".to_string(), name.clone());

    let field_set = point
        .reading
        .metrics()
        .into_iter()
        .map(|m| (m.name.to_string(), FieldValue::from(m.value)))
        .collect();

    DataPoint {
        measurement: measurement(point.reading.family).to_string(),
        tag_set,
        field_set,
        timestamp: point.timestamp.map(|t| t.unix_timestamp()),
    }
}

/// Buffers line-protocol rows and writes them to InfluxDB on flush.
pub struct InfluxSink {
    client: Client,
    config: InfluxConfig,
    bridge: String,
    buffer: Mutex<VecDeque<String>>,
}

impl fmt::Debug for InfluxSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxSink")
            .field("url", &self.config.url)
            .field("version", &self.config.version)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

impl InfluxSink {
    pub fn new(config: InfluxConfig, bridge: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::sink(SINK_NAME, e))?;
        Ok(Self {
            client,
            config,
            bridge: bridge.to_string(),
            buffer: Mutex::new(VecDeque::new()),
        })
    }

    /// Write endpoint and query for the configured API version.
    pub fn write_url(&self) -> (String, Vec<(&'static str, String)>) {
        let base = self.config.url.trim_end_matches('/');
        match self.config.version {
            InfluxVersion::V2 => (
                format!("{base}/api/v2/write"),
                vec![
                    ("org", self.config.org.clone()),
                    ("bucket", self.config.bucket.clone()),
                    ("precision", "s".to_string()),
                ],
            ),
            InfluxVersion::V1 => {
                let mut query = vec![
                    ("db", self.config.database.clone()),
                    ("precision", "s".to_string()),
                ];
                if let (Some(u), Some(p)) = (&self.config.username, &self.config.password) {
                    query.push(("u", u.clone()));
                    query.push(("p", p.clone()));
                }
                (format!("{base}/write"), query)
            }
        }
    }

    /// Rows currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn push(&self, line: String) {
        let Ok(mut buffer) = self.buffer.lock() else {
            return;
        };
        buffer.push_back(line);
        if buffer.len() > self.config.max_buffer {
            let excess = buffer.len() - self.config.max_buffer;
            buffer.drain(..excess);
            warn!("Influx buffer full, dropped {} oldest points", excess);
        }
    }

    /// Take everything buffered, split into write batches.
    fn take_batches(&self) -> Vec<String> {
        let lines: Vec<String> = match self.buffer.lock() {
            Ok(mut buffer) => buffer.drain(..).collect(),
            Err(_) => return Vec::new(),
        };
        lines
            .chunks(self.config.batch_size.max(1))
            .map(|chunk| chunk.join("\n"))
            .collect()
    }

    async fn post(&self, body: String) -> Result<()> {
        let (url, query) = self.write_url();
        let mut request = self.client.post(&url).query(&query).body(body);
        if self.config.version == InfluxVersion::V2
            && let Some(token) = &self.config.token
        {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request.send().await.map_err(|e| Error::sink(SINK_NAME, e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::sink(SINK_NAME, format!("HTTP {status}: {body}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for InfluxSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn announce(&self, _device: &DeviceIdentity) -> Result<()> {
        // Influx needs no registration.
        Ok(())
    }

    async fn write(&self, point: &Point) -> Result<()> {
        self.push(data_point(&self.bridge, point).to_string());
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let batches = self.take_batches();
        let mut failed = 0;
        let total = batches.len();
        for batch in batches {
            if let Err(e) = self.post(batch).await {
                warn!("{}", e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::sink(
                SINK_NAME,
                format!("{failed} of {total} batches dropped"),
            ));
        }
        if total > 0 {
            debug!("Wrote {} batches to InfluxDB", total);
        }
        Ok(())
    }
}
