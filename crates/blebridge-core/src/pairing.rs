//! Device pairing.
//!
//! Pairing is the only flow started from outside the acquisition task. The
//! control surface calls [`Scheduler::request_pairing`](crate::Scheduler::request_pairing),
//! which moves the device to `PairingRequested`; the next cycle runs the
//! flow. While bonding, the host asks for a PIN through [`PairingPinSource`],
//! which raises the flag returned by [`PinHandle::pin_requested`] and waits
//! for [`PinHandle::supply_pin`] or [`PinHandle::cancel`].
//!
//! ```text
//! NotPaired -> PairingRequested -> Pairing -> Paired
//!                                     |
//!                                     +-> NotPaired (no PIN, bond or name read failed)
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use blebridge_types::uuid::{DEVICE_NAME, GAP_SERVICE};

use crate::error::{Error, Result};
use crate::host::{BleHost, PinSource, normalize_address, wait_for_release};
use crate::registry::{PairingState, Registry, truncate_name};
use crate::watchdog::{CONNECT_DEADLINE, GATT_DEADLINE, Watchdog};

/// How long a bonding attempt waits for a PIN by default.
pub const DEFAULT_PIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinReply {
    Pin(u32),
    Cancel,
}

#[derive(Debug, Default)]
struct PinState {
    requested: bool,
    pending: Option<PinReply>,
}

#[derive(Debug, Default)]
struct PinShared {
    state: Mutex<PinState>,
    notify: Notify,
}

/// Cross-task handle for delivering a PIN to the active pairing flow.
#[derive(Debug, Clone, Default)]
pub struct PinHandle {
    shared: Arc<PinShared>,
}

impl PinHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a PIN. Returns `false` if a reply is already waiting to be
    /// consumed.
    pub fn supply_pin(&self, pin: u32) -> bool {
        let Ok(mut state) = self.shared.state.lock() else {
            return false;
        };
        if state.pending.is_some() {
            return false;
        }
        state.pending = Some(PinReply::Pin(pin));
        drop(state);
        self.shared.notify.notify_one();
        true
    }

    /// Answer the current (or next) PIN request with "no PIN".
    pub fn cancel(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.pending = Some(PinReply::Cancel);
        }
        self.shared.notify.notify_one();
    }

    /// Whether the host is currently waiting for a PIN.
    pub fn pin_requested(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.requested)
            .unwrap_or(false)
    }

    fn reset(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            *state = PinState::default();
        }
    }

    fn set_requested(&self, requested: bool) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.requested = requested;
        }
    }

    fn take(&self) -> Option<PinReply> {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.pending.take())
    }
}

/// [`PinSource`] that waits on a [`PinHandle`] for at most `timeout`.
#[derive(Debug, Clone)]
pub struct PairingPinSource {
    handle: PinHandle,
    timeout: Duration,
}

impl PairingPinSource {
    pub fn new(handle: PinHandle, timeout: Duration) -> Self {
        Self { handle, timeout }
    }
}

#[async_trait]
impl PinSource for PairingPinSource {
    async fn request_pin(&self) -> Option<u32> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        self.handle.set_requested(true);
        let reply = loop {
            if let Some(reply) = self.handle.take() {
                break Some(reply);
            }
            if tokio::time::timeout_at(deadline, self.handle.shared.notify.notified())
                .await
                .is_err()
            {
                debug!("No PIN within {:?}", self.timeout);
                break None;
            }
        };
        self.handle.set_requested(false);
        match reply {
            Some(PinReply::Pin(pin)) => Some(pin),
            Some(PinReply::Cancel) | None => None,
        }
    }
}

/// The single pairing flow of the bridge.
#[derive(Debug)]
pub struct PairingFlow {
    handle: PinHandle,
    timeout: Duration,
    active: Option<String>,
}

impl Default for PairingFlow {
    fn default() -> Self {
        Self::new(DEFAULT_PIN_TIMEOUT)
    }
}

impl PairingFlow {
    pub fn new(timeout: Duration) -> Self {
        Self {
            handle: PinHandle::new(),
            timeout,
            active: None,
        }
    }

    pub fn handle(&self) -> PinHandle {
        self.handle.clone()
    }

    /// Address of the device being paired, if any.
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Queue pairing of a registered device.
    ///
    /// # Errors
    ///
    /// [`Error::PairingBusy`] while another flow is active,
    /// [`Error::UnknownDevice`] for unregistered addresses and
    /// [`Error::InvalidPairingState`] for devices that are already paired.
    pub fn request(&mut self, registry: &mut Registry, address: &str) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(Error::PairingBusy(active.clone()));
        }
        let device = registry
            .get_mut(address)
            .ok_or_else(|| Error::UnknownDevice(normalize_address(address)))?;
        if device.pairing != PairingState::NotPaired {
            return Err(Error::InvalidPairingState {
                address: device.address.clone(),
                state: device.pairing,
                action: "pair",
            });
        }

        device.pairing = PairingState::PairingRequested;
        self.handle.reset();
        self.active = Some(device.address.clone());
        info!("Pairing requested for {}", device.address);
        Ok(())
    }

    /// Run the queued flow, if any, to completion.
    ///
    /// Returns the resulting state, or `None` when nothing ran. A flow that
    /// cannot start because the radio is still held stays queued. Only
    /// watchdog expiry is reported as an error; every other failure ends in
    /// `NotPaired`.
    #[instrument(skip_all, fields(address = self.active.as_deref().unwrap_or_default()))]
    pub async fn run(
        &mut self,
        host: &dyn BleHost,
        registry: &mut Registry,
        watchdog: &Watchdog,
        release_wait: Duration,
    ) -> Result<Option<PairingState>> {
        let Some(address) = self.active.clone() else {
            return Ok(None);
        };
        let Some(device) = registry.get_mut(&address) else {
            // Removed while queued.
            self.active = None;
            return Ok(None);
        };
        if !wait_for_release(host, release_wait).await {
            debug!("Radio still held, pairing {} deferred", address);
            return Ok(Some(device.pairing));
        }
        device.pairing = PairingState::Pairing;
        info!("Pairing {}", address);

        let outcome = self.bond(host, watchdog, &address).await;

        if let Err(e) = host.disconnect().await {
            warn!("Failed to release {} after pairing: {}", address, e);
        }
        self.handle.set_requested(false);
        self.active = None;

        let device = registry
            .get_mut(&address)
            .ok_or_else(|| Error::UnknownDevice(address.clone()))?;
        match outcome {
            Ok(name) => {
                device.pairing = PairingState::Paired;
                if device.name.is_empty() && !name.is_empty() {
                    device.name = truncate_name(&name).to_string();
                }
                info!("Paired with {} ({})", address, name);
                registry.save()?;
                Ok(Some(PairingState::Paired))
            }
            Err(e) => {
                device.pairing = PairingState::NotPaired;
                warn!("Pairing {} failed: {}", address, e);
                if e.is_fatal() {
                    return Err(e);
                }
                Ok(Some(PairingState::NotPaired))
            }
        }
    }

    /// Connect unbonded, bond, then prove the bond with a name read.
    async fn bond(&self, host: &dyn BleHost, watchdog: &Watchdog, address: &str) -> Result<String> {
        watchdog
            .guard("pair connect", CONNECT_DEADLINE, host.connect(address, false))
            .await?;

        let pins = PairingPinSource::new(self.handle.clone(), self.timeout);
        watchdog
            .guard(
                "bonding",
                self.timeout + CONNECT_DEADLINE,
                host.request_bonding(&pins),
            )
            .await?;

        let raw = watchdog
            .guard(
                "read device name",
                GATT_DEADLINE,
                host.read_characteristic(GAP_SERVICE, DEVICE_NAME),
            )
            .await?;
        Ok(String::from_utf8_lossy(&raw).trim_end_matches('\0').to_string())
    }

    /// Forget the bond of a registered device and persist `NotPaired`.
    #[instrument(skip(self, host, registry))]
    pub async fn unpair(
        &self,
        host: &dyn BleHost,
        registry: &mut Registry,
        address: &str,
    ) -> Result<()> {
        let address = normalize_address(address);
        if self.active.as_deref() == Some(address.as_str()) {
            return Err(Error::PairingBusy(address));
        }
        let device = registry
            .get_mut(&address)
            .ok_or_else(|| Error::UnknownDevice(address.clone()))?;

        host.remove_bond(&address).await?;
        device.pairing = PairingState::NotPaired;
        info!("Unpaired {}", address);
        registry.save()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockHost};
    use crate::registry::{Device, MemoryStore};
    use blebridge_types::Family;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    fn setup(pin: u32) -> (MockHost, Registry, MemoryStore) {
        let host = MockHost::new();
        host.add_device(
            ADDR,
            MockDevice::new()
                .with_pin(pin)
                .with_characteristic(DEVICE_NAME, b"Aranet4 1A2B3".to_vec()),
        );
        let store = MemoryStore::new();
        let mut registry = Registry::load(store.clone()).unwrap();
        registry.insert(Device::new(ADDR, "Aranet4 1A2B3", Family::Aranet4));
        (host, registry, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_consumed_once() {
        let handle = PinHandle::new();
        assert!(handle.supply_pin(123_456));
        assert!(!handle.supply_pin(654_321));

        let source = PairingPinSource::new(handle.clone(), DEFAULT_PIN_TIMEOUT);
        assert_eq!(source.request_pin().await, Some(123_456));
        assert!(!handle.pin_requested());
        assert!(handle.supply_pin(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_request_times_out() {
        let handle = PinHandle::new();
        let source = PairingPinSource::new(handle.clone(), Duration::from_secs(30));
        let waiter = tokio::spawn(async move { source.request_pin().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.pin_requested());
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(waiter.await.unwrap(), None);
        assert!(!handle.pin_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_delivered_while_waiting() {
        let handle = PinHandle::new();
        let source = PairingPinSource::new(handle.clone(), Duration::from_secs(30));
        let waiter = tokio::spawn(async move { source.request_pin().await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(handle.pin_requested());
        assert!(handle.supply_pin(4321));
        assert_eq!(waiter.await.unwrap(), Some(4321));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_succeeds_and_persists() {
        let (host, mut registry, store) = setup(111_111);
        let mut flow = PairingFlow::default();
        flow.request(&mut registry, ADDR).unwrap();
        assert_eq!(registry.get(ADDR).unwrap().pairing, PairingState::PairingRequested);
        assert!(flow.handle().supply_pin(111_111));

        let state = flow
            .run(&host, &mut registry, &Watchdog::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state, Some(PairingState::Paired));
        assert!(store.records()[0].settings.paired);
        assert!(flow.active().is_none());
        assert!(!host.is_connected_now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_pairing_is_not_paired() {
        let (host, mut registry, store) = setup(111_111);
        let mut flow = PairingFlow::default();
        flow.request(&mut registry, ADDR).unwrap();
        let handle = flow.handle();

        let canceller = tokio::spawn(async move {
            while !handle.pin_requested() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            handle.cancel();
        });

        let state = flow
            .run(&host, &mut registry, &Watchdog::default(), Duration::from_secs(1))
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(state, Some(PairingState::NotPaired));
        assert_eq!(registry.get(ADDR).unwrap().pairing, PairingState::NotPaired);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_pin_is_not_paired() {
        let (host, mut registry, _) = setup(111_111);
        let mut flow = PairingFlow::default();
        flow.request(&mut registry, ADDR).unwrap();
        flow.handle().supply_pin(999_999);

        let state = flow
            .run(&host, &mut registry, &Watchdog::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state, Some(PairingState::NotPaired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_is_busy() {
        let (_, mut registry, _) = setup(1);
        registry.insert(Device::new("AA:BB:CC:DD:EE:02", "Aranet2", Family::Aranet2));
        let mut flow = PairingFlow::default();
        flow.request(&mut registry, ADDR).unwrap();

        let err = flow.request(&mut registry, "AA:BB:CC:DD:EE:02").unwrap_err();
        assert!(matches!(err, Error::PairingBusy(ref a) if a == ADDR));

        let mut flow = PairingFlow::default();
        let err = flow.request(&mut registry, "00:00:00:00:00:00").unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpair_removes_bond() {
        let (host, mut registry, store) = setup(1);
        registry.get_mut(ADDR).unwrap().pairing = PairingState::Paired;

        let flow = PairingFlow::default();
        flow.unpair(&host, &mut registry, ADDR).await.unwrap();
        assert_eq!(registry.get(ADDR).unwrap().pairing, PairingState::NotPaired);
        assert_eq!(host.removed_bonds(), vec![ADDR.to_string()]);
        assert_eq!(store.save_count(), 1);
    }
}
