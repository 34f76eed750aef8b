//! The BLE host seam.
//!
//! [`BleHost`] abstracts the single radio the bridge drives. The scheduler,
//! the pairing flow and the history backfill only talk to the radio through
//! it, which lets tests swap in [`MockHost`](crate::mock::MockHost).

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// Time a host allows for lookup, connect and service discovery before it
/// reports [`ConnectFailureReason::Timeout`](crate::error::ConnectFailureReason::Timeout).
///
/// Well inside [`CONNECT_DEADLINE`](crate::watchdog::CONNECT_DEADLINE): an
/// unreachable device must fail on its own before the watchdog treats the
/// radio as hung.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One advertisement seen during a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Normalized (upper-case) BLE address.
    pub address: String,
    pub rssi: Option<i16>,
    pub name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer-specific data, payloads without the company id.
    pub manufacturer_data: Vec<(u16, Vec<u8>)>,
}

impl Advertisement {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self {
            address: normalize_address(address.as_ref()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    #[must_use]
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    #[must_use]
    pub fn with_manufacturer_data(mut self, id: u16, payload: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data.push((id, payload.into()));
        self
    }

    /// Payload of the first manufacturer record with company `id`.
    #[must_use]
    pub fn manufacturer_payload(&self, id: u16) -> Option<&[u8]> {
        self.manufacturer_data
            .iter()
            .find(|(mid, _)| *mid == id)
            .map(|(_, data)| data.as_slice())
    }
}

/// Canonical form of a BLE address: trimmed and upper-case.
#[must_use]
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

/// Source of a bonding PIN.
///
/// Returning `None` means "no PIN"; the host must then fail bonding cleanly.
#[async_trait]
pub trait PinSource: Send + Sync {
    async fn request_pin(&self) -> Option<u32>;
}

/// Operations the bridge needs from a BLE central.
///
/// The host holds at most one connection; characteristic operations act on
/// it and fail with [`Error::NotConnected`](crate::Error::NotConnected)
/// when there is none.
#[async_trait]
pub trait BleHost: Send + Sync {
    /// Scan for `duration` and return what was heard.
    async fn scan(&self, duration: Duration) -> Result<Vec<Advertisement>>;

    /// Connect to `address`, using the stored bond when `bonded` is set.
    async fn connect(&self, address: &str, bonded: bool) -> Result<()>;

    /// Release the current connection. Releasing may complete after this
    /// returns; [`is_connected`](Self::is_connected) reports when it has.
    async fn disconnect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()>;

    /// Bond with the connected device, asking `pins` when a PIN is needed.
    async fn request_bonding(&self, pins: &dyn PinSource) -> Result<()>;

    /// Forget bond material for `address`.
    async fn remove_bond(&self, address: &str) -> Result<()>;
}

const RELEASE_POLL: Duration = Duration::from_millis(50);

/// Wait up to `wait` for the host to report no live connection.
///
/// Returns `false` if a connection is still held when the wait runs out.
pub async fn wait_for_release(host: &dyn BleHost, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if !host.is_connected().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(RELEASE_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(" aa:bb:cc:dd:ee:ff "), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_manufacturer_payload_lookup() {
        let adv = Advertisement::new("aa:bb:cc:dd:ee:ff")
            .with_manufacturer_data(0x004C, vec![1, 2])
            .with_manufacturer_data(0x0702, vec![3, 4, 5]);
        assert_eq!(adv.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(adv.manufacturer_payload(0x0702), Some(&[3u8, 4, 5][..]));
        assert_eq!(adv.manufacturer_payload(0x0499), None);
    }
}
