//! MQTT sink with Home Assistant discovery.
//!
//! # Topic Structure
//!
//! - `{prefix}/sensor/{slug}/{metric}` - one value per metric, e.g. `co2`
//! - `{discovery_prefix}/sensor/{slug}-{metric}/config` - discovery document
//!
//! `{slug}` is the device name, lower-cased, with spaces replaced by `-`.
//! Discovery documents for every metric the device's family reports are
//! queued when the device is announced, ahead of its first values.
//!
//! # Example Configuration
//!
//! ```toml
//! [mqtt]
//! enabled = true
//! broker = "mqtt://localhost:1883"
//! topic_prefix = "home/sensors"
//! discovery_prefix = "homeassistant"
//! qos = 1
//! ```
//!
//! Publishes are queued as points arrive and handed to the client on flush;
//! whatever the client refuses stays queued for the next flush, up to
//! [`MAX_QUEUED`] messages. Only live readings are published: a state topic holds the current value,
//! so replaying backfilled history there would only overwrite it with older
//! data.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use blebridge_core::{DeviceIdentity, Error, Point, Result, TelemetrySink};
use blebridge_types::MetricInfo;

use crate::config::MqttConfig;

const SINK_NAME: &str = "mqtt";

/// Messages kept while the client refuses publishes; the oldest go first.
pub const MAX_QUEUED: usize = 1000;

/// One queued publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// Home Assistant sensor discovery document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discovery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    pub name: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub unit_of_measurement: &'static str,
    pub unique_id: String,
}

/// Topic segment for a device: the name lower-cased with spaces as `-`,
/// or the address without separators for unnamed devices.
pub fn slug(device: &DeviceIdentity) -> String {
    let base = if device.name.trim().is_empty() {
        device.address.replace(':', "")
    } else {
        device.name.trim().to_string()
    };
    base.to_lowercase().replace(' ', "-").replace(['#', '+', '/'], "_")
}

pub fn state_topic(prefix: &str, slug: &str, metric: &str) -> String {
    format!("{prefix}/sensor/{slug}/{metric}")
}

pub fn discovery_topic(discovery_prefix: &str, slug: &str, metric: &str) -> String {
    format!("{discovery_prefix}/sensor/{slug}-{metric}/config")
}

/// Parse an MQTT broker URL into (host, port, use_tls).
fn parse_broker_url(url: &str) -> std::result::Result<(String, u16, bool), String> {
    let (use_tls, rest) = if let Some(stripped) = url.strip_prefix("mqtt://") {
        (false, stripped)
    } else if let Some(stripped) = url.strip_prefix("mqtts://") {
        (true, stripped)
    } else {
        return Err("Invalid scheme: URL must start with mqtt:// or mqtts://".to_string());
    };

    let default_port = if use_tls { 8883 } else { 1883 };
    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => {
            let port = p.parse::<u16>().map_err(|_| format!("Invalid port: {}", p))?;
            (h.to_string(), port)
        }
        None => (rest.to_string(), default_port),
    };

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }
    Ok((host, port, use_tls))
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Publishes readings to an MQTT broker.
pub struct MqttSink {
    client: AsyncClient,
    config: MqttConfig,
    queue: Mutex<Vec<Message>>,
}

impl std::fmt::Debug for MqttSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSink")
            .field("broker", &self.config.broker)
            .field("topic_prefix", &self.config.topic_prefix)
            .finish_non_exhaustive()
    }
}

impl MqttSink {
    /// Create the client and spawn its event loop.
    ///
    /// The event loop reconnects on its own; connection errors are logged and
    /// never reach acquisition.
    pub fn connect(config: MqttConfig) -> Result<(Self, JoinHandle<()>)> {
        let (host, port, use_tls) =
            parse_broker_url(&config.broker).map_err(|e| Error::sink(SINK_NAME, e))?;

        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        if use_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 100);
        info!("MQTT sink publishing to {} under '{}'", config.broker, config.topic_prefix);
        let task = tokio::spawn(drive(eventloop));
        Ok((Self::with_client(client, config), task))
    }

    fn with_client(client: AsyncClient, config: MqttConfig) -> Self {
        Self {
            client,
            config,
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Discovery documents for `metrics` of `device`.
    pub fn discovery(&self, device: &DeviceIdentity, metrics: &[MetricInfo]) -> Vec<Message> {
        let slug = slug(device);
        let label = if device.name.is_empty() {
            &device.address
        } else {
            &device.name
        };
        metrics
            .iter()
            .map(|m| {
                let doc = Discovery {
                    device_class: m.device_class,
                    name: format!("{label} {}", m.name),
                    state_topic: state_topic(&self.config.topic_prefix, &slug, m.name),
                    unit_of_measurement: m.unit,
                    unique_id: format!("{}-{}-{}", self.config.client_id, slug, m.name),
                };
                Message {
                    topic: discovery_topic(&self.config.discovery_prefix, &slug, m.name),
                    payload: serde_json::to_string(&doc).unwrap_or_default(),
                    retain: true,
                }
            })
            .collect()
    }

    /// Value messages for a point.
    pub fn values(&self, point: &Point) -> Vec<Message> {
        let slug = slug(&point.device);
        point
            .reading
            .sensor_metrics()
            .into_iter()
            .map(|m| Message {
                topic: state_topic(&self.config.topic_prefix, &slug, m.name),
                payload: m.value.to_string(),
                retain: self.config.retain,
            })
            .collect()
    }

    /// Messages queued for the next flush.
    pub fn queued(&self) -> Vec<Message> {
        self.queue.lock().map(|q| q.clone()).unwrap_or_default()
    }

    fn enqueue(&self, messages: Vec<Message>) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| Error::sink(SINK_NAME, "queue poisoned"))?;
        queue.extend(messages);
        Ok(())
    }

    /// Put `unsent` back ahead of anything queued since the flush began.
    fn requeue(&self, mut unsent: Vec<Message>) {
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };
        unsent.append(&mut queue);
        if unsent.len() > MAX_QUEUED {
            let dropped = unsent.len() - MAX_QUEUED;
            warn!("MQTT queue full, dropping {} oldest messages", dropped);
            unsent.drain(..dropped);
        }
        *queue = unsent;
    }
}

async fn drive(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => info!("MQTT connected: {:?}", ack),
            Ok(Event::Incoming(Packet::PingResp)) => debug!("MQTT ping response received"),
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}. Reconnecting...", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

#[async_trait]
impl TelemetrySink for MqttSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn announce(&self, device: &DeviceIdentity) -> Result<()> {
        let metrics = device.family.sensor_metrics();
        if metrics.is_empty() {
            debug!("Nothing to announce for {} ({})", device.address, device.family);
            return Ok(());
        }
        debug!("Announcing {} metrics of {}", metrics.len(), device.address);
        self.enqueue(self.discovery(device, metrics))
    }

    async fn write(&self, point: &Point) -> Result<()> {
        if point.timestamp.is_some() {
            return Ok(());
        }
        self.enqueue(self.values(point))
    }

    async fn flush(&self) -> Result<()> {
        let queue = match self.queue.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(_) => return Err(Error::sink(SINK_NAME, "queue poisoned")),
        };
        if queue.is_empty() {
            return Ok(());
        }

        let qos = qos(self.config.qos);
        let count = queue.len();
        let mut messages = queue.into_iter();
        while let Some(message) = messages.next() {
            let published = self
                .client
                .publish(
                    message.topic.clone(),
                    qos,
                    message.retain,
                    message.payload.clone(),
                )
                .await;
            if let Err(e) = published {
                let unsent: Vec<_> = std::iter::once(message).chain(messages).collect();
                warn!("MQTT publish failed, keeping {} messages queued", unsent.len());
                self.requeue(unsent);
                return Err(Error::sink(SINK_NAME, e));
            }
        }
        debug!("Handed {} messages to the MQTT client", count);
        Ok(())
    }
}
