//! [`BleHost`] on top of btleplug.
//!
//! btleplug exposes no pairing API. Bonding is initiated the way the OS
//! stacks expect it: by touching a characteristic that requires an
//! encrypted link, with the OS pairing agent answering the PIN prompt.
//! Bond removal is likewise left to the OS tooling (`bluetoothctl remove`);
//! [`BtleplugHost::remove_bond`] only tears the link down.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use blebridge_types::uuid::{CURRENT_READINGS_DETAIL, SAF_SERVICE_NEW};

use crate::error::{ConnectFailureReason, Error, Result};
use crate::host::{Advertisement, BleHost, DEFAULT_CONNECT_TIMEOUT, PinSource, normalize_address};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or_else(|| {
        Error::connect_failed("adapter", ConnectFailureReason::AdapterUnavailable)
    })
}

#[derive(Default)]
struct Link {
    /// Peripherals seen by the last scans, by normalized address.
    known: HashMap<String, Peripheral>,
    /// The open connection, if any.
    current: Option<(String, Peripheral)>,
    /// A connection we asked to close but the stack may still hold.
    releasing: Option<Peripheral>,
}

/// The single radio of the bridge.
pub struct BtleplugHost {
    adapter: Adapter,
    connect_timeout: Duration,
    link: Mutex<Link>,
}

impl std::fmt::Debug for BtleplugHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugHost")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl BtleplugHost {
    /// Open the first adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(get_adapter().await?))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            link: Mutex::new(Link::default()),
        }
    }

    /// Time allowed for lookup, connect and service discovery. Keep it
    /// below the watchdog's connect deadline so an unreachable device is a
    /// per-device failure.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(p) = self.link.lock().await.known.get(address) {
            return Ok(p.clone());
        }
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(props)) = peripheral.properties().await
                && normalize_address(&props.address.to_string()) == address
            {
                return Ok(peripheral);
            }
        }
        Err(Error::connect_failed(
            address,
            ConnectFailureReason::Other("not seen in recent scans".into()),
        ))
    }

    async fn current(&self) -> Result<Peripheral> {
        self.link
            .lock()
            .await
            .current
            .as_ref()
            .map(|(_, p)| p.clone())
            .ok_or(Error::NotConnected)
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        let chars = peripheral.characteristics();
        chars
            .iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .or_else(|| chars.iter().find(|c| c.uuid == characteristic))
            .cloned()
            .ok_or(Error::CharacteristicNotFound {
                service,
                characteristic,
            })
    }
}

/// Map a stack error raised while connecting.
fn connect_error(address: &str, err: btleplug::Error) -> Error {
    let reason = match err {
        btleplug::Error::PermissionDenied => ConnectFailureReason::BondingRejected,
        btleplug::Error::TimedOut(_) => ConnectFailureReason::Timeout,
        other => ConnectFailureReason::Other(other.to_string()),
    };
    Error::connect_failed(address, reason)
}

#[async_trait]
impl BleHost for BtleplugHost {
    /// Scan for `duration` while draining the adapter's event stream.
    ///
    /// Returns early if the stream ends, which happens when the adapter
    /// goes away; the caller sees a short scan.
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let window = tokio::time::sleep(duration);
        tokio::pin!(window);
        let mut seen = 0usize;
        loop {
            tokio::select! {
                () = &mut window => break,
                event = events.next() => match event {
                    Some(_) => seen += 1,
                    None => {
                        warn!("Adapter event stream ended after {} events", seen);
                        break;
                    }
                },
            }
        }
        self.adapter.stop_scan().await?;

        let mut out = Vec::new();
        let mut known = HashMap::new();
        for peripheral in self.adapter.peripherals().await? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let mut adv = Advertisement::new(props.address.to_string());
            adv.name = props.local_name;
            adv.rssi = props.rssi;
            adv.service_uuids = props.services;
            let mut manufacturer: Vec<_> = props.manufacturer_data.into_iter().collect();
            manufacturer.sort_by_key(|(id, _)| *id);
            adv.manufacturer_data = manufacturer;

            known.insert(adv.address.clone(), peripheral);
            out.push(adv);
        }
        debug!("Scan heard {} peripherals ({} events)", out.len(), seen);
        self.link.lock().await.known = known;
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn connect(&self, address: &str, bonded: bool) -> Result<()> {
        let address = normalize_address(address);
        if self.is_connected().await {
            return Err(Error::connect_failed(&address, ConnectFailureReason::Busy));
        }
        let peripheral = timeout(self.connect_timeout, async {
            let peripheral = self.find_peripheral(&address).await?;
            peripheral
                .connect()
                .await
                .map_err(|e| connect_error(&address, e))?;
            peripheral
                .discover_services()
                .await
                .map_err(|e| connect_error(&address, e))?;
            Ok::<_, Error>(peripheral)
        })
        .await
        .map_err(|_| Error::connect_failed(&address, ConnectFailureReason::Timeout))??;

        if bonded {
            // An encrypted read fails straight away when the device dropped
            // our bond.
            if let Ok(c) = Self::find_characteristic(&peripheral, SAF_SERVICE_NEW, CURRENT_READINGS_DETAIL)
                && let Err(e) = peripheral.read(&c).await
            {
                if let Err(d) = peripheral.disconnect().await {
                    warn!("Disconnect from {} after a rejected bond failed: {}", address, d);
                }
                return Err(connect_error(&address, e));
            }
        }

        info!("Connected to {}", address);
        self.link.lock().await.current = Some((address, peripheral));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let taken = self.link.lock().await.current.take();
        if let Some((address, peripheral)) = taken {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect from {} failed: {}", address, e);
            }
            debug!("Released {}", address);
            self.link.lock().await.releasing = Some(peripheral);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let (current, releasing) = {
            let link = self.link.lock().await;
            (
                link.current.as_ref().map(|(_, p)| p.clone()),
                link.releasing.clone(),
            )
        };
        if let Some(p) = current
            && p.is_connected().await.unwrap_or(false)
        {
            return true;
        }
        if let Some(p) = releasing {
            if p.is_connected().await.unwrap_or(false) {
                return true;
            }
            self.link.lock().await.releasing = None;
        }
        false
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let peripheral = self.current().await?;
        let c = Self::find_characteristic(&peripheral, service, characteristic)?;
        Ok(peripheral.read(&c).await?)
    }

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        let peripheral = self.current().await?;
        let c = Self::find_characteristic(&peripheral, service, characteristic)?;
        Ok(peripheral.write(&c, data, WriteType::WithResponse).await?)
    }

    #[instrument(skip_all)]
    async fn request_bonding(&self, pins: &dyn PinSource) -> Result<()> {
        let peripheral = self.current().await?;
        let address = self
            .link
            .lock()
            .await
            .current
            .as_ref()
            .map(|(a, _)| a.clone())
            .unwrap_or_default();

        if pins.request_pin().await.is_none() {
            return Err(Error::connect_failed(
                address,
                ConnectFailureReason::BondingRejected,
            ));
        }
        info!("PIN received; completing bond with {} through the OS agent", address);

        let c = Self::find_characteristic(&peripheral, SAF_SERVICE_NEW, CURRENT_READINGS_DETAIL)?;
        peripheral
            .read(&c)
            .await
            .map(|_| ())
            .map_err(|e| connect_error(&address, e))
    }

    async fn remove_bond(&self, address: &str) -> Result<()> {
        let address = normalize_address(address);
        let connected_here = self
            .link
            .lock()
            .await
            .current
            .as_ref()
            .is_some_and(|(a, _)| *a == address);
        if connected_here {
            self.disconnect().await?;
        }
        info!(
            "Forgot {}; remove the OS bond with the platform tools if it persists",
            address
        );
        Ok(())
    }
}
