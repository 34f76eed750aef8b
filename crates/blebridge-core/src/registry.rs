//! Registered devices and their persistence.
//!
//! The [`Registry`] owns every device the user promoted out of the scan
//! cache. It is persisted through a [`RegistryStore`] as one document that
//! is rewritten in full on every save:
//!
//! ```json
//! {"devices":[{"mac":"AA:BB:CC:DD:EE:FF","name":"Aranet4 1A2B3","family":"Aranet4",
//!   "settings":{"enabled":true,"paired":false,"gatt":false,"history":false}}]}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use blebridge_types::{Family, Reading};

use crate::error::{RegistryError, Result};
use crate::host::normalize_address;

/// Longest device name kept, in bytes.
pub const MAX_NAME_BYTES: usize = 23;

/// Pairing state of a registered device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingState {
    #[default]
    NotPaired,
    /// The user asked to pair; the flow has not started yet.
    PairingRequested,
    /// Bonding in progress.
    Pairing,
    Paired,
}

/// User-controlled per-device switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFlags {
    /// Whether the scheduler takes readings at all.
    pub enabled: bool,
    /// Whether the scheduler may connect when no beacon is available.
    pub gatt_allowed: bool,
    /// Whether missed samples are backfilled from the on-board log.
    pub history_enabled: bool,
}

impl Default for DeviceFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            gatt_allowed: false,
            history_enabled: false,
        }
    }
}

/// A registered device and its acquisition state.
#[derive(Debug, Clone)]
pub struct Device {
    pub address: String,
    pub name: String,
    pub family: Family,
    pub flags: DeviceFlags,
    pub pairing: PairingState,
    pub last_reading: Option<Reading>,
    /// Unset until the first successful read.
    pub last_updated: Option<Instant>,
    /// Log records still to download.
    pub pending_history: u32,
    /// Whether the sinks have received this device's one-time registration.
    pub sink_config_sent: bool,
    pub rssi: Option<i16>,
    pub last_seen: Option<Instant>,
}

impl Device {
    pub fn new(address: &str, name: &str, family: Family) -> Self {
        Self {
            address: normalize_address(address),
            name: truncate_name(name).to_string(),
            family,
            flags: DeviceFlags::default(),
            pairing: PairingState::NotPaired,
            last_reading: None,
            last_updated: None,
            pending_history: 0,
            sink_config_sent: false,
            rssi: None,
            last_seen: None,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.pairing == PairingState::Paired
    }

    /// Instant at which the device should have a fresh sample, if it has
    /// ever been read.
    pub fn expected_next(&self) -> Option<Instant> {
        let updated = self.last_updated?;
        let reading = self.last_reading.as_ref()?;
        let wait = reading.interval.saturating_sub(reading.age);
        Some(updated + std::time::Duration::from_secs(u64::from(wait)))
    }

    fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            mac: self.address.clone(),
            name: self.name.clone(),
            family: self.family,
            settings: DeviceSettings {
                enabled: self.flags.enabled,
                paired: self.is_paired(),
                gatt: self.flags.gatt_allowed,
                history: self.flags.history_enabled,
            },
            pending_history: self.pending_history,
        }
    }

    fn from_record(record: DeviceRecord) -> Self {
        let mut device = Self::new(&record.mac, &record.name, record.family);
        device.flags = DeviceFlags {
            enabled: record.settings.enabled,
            gatt_allowed: record.settings.gatt,
            history_enabled: record.settings.history,
        };
        if record.settings.paired {
            device.pairing = PairingState::Paired;
        }
        device.pending_history = record.pending_history;
        device
    }
}

/// Cut `name` to at most [`MAX_NAME_BYTES`] without splitting a character.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_BYTES {
        return name;
    }
    let mut end = MAX_NAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Persisted form of a [`Device`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub mac: String,
    pub name: String,
    #[serde(default)]
    pub family: Family,
    pub settings: DeviceSettings,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pending_history: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub enabled: bool,
    pub paired: bool,
    pub gatt: bool,
    pub history: bool,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

/// Where registry records live between runs.
pub trait RegistryStore: Send + Sync {
    fn load(&self) -> std::result::Result<Vec<DeviceRecord>, RegistryError>;
    fn save(&self, records: &[DeviceRecord]) -> std::result::Result<(), RegistryError>;
}

/// JSON document on disk, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> std::result::Result<Vec<DeviceRecord>, RegistryError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No registry at {}, starting empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(Self::io_error(&self.path, e)),
        };
        let doc: RegistryDocument = serde_json::from_str(&content)?;
        Ok(doc.devices)
    }

    fn save(&self, records: &[DeviceRecord]) -> std::result::Result<(), RegistryError> {
        let doc = RegistryDocument {
            devices: records.to_vec(),
        };
        let content = serde_json::to_string_pretty(&doc)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Self::io_error(parent, e))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(|e| Self::io_error(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Self::io_error(&self.path, e))
    }
}

/// In-memory store. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    records: Vec<DeviceRecord>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<DeviceRecord>) -> Self {
        let store = Self::default();
        if let Ok(mut inner) = store.inner.lock() {
            inner.records = records;
        }
        store
    }

    /// Records as of the last save.
    pub fn records(&self) -> Vec<DeviceRecord> {
        self.inner
            .lock()
            .map(|inner| inner.records.clone())
            .unwrap_or_default()
    }

    /// Number of saves so far.
    pub fn save_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.saves).unwrap_or(0)
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> std::result::Result<Vec<DeviceRecord>, RegistryError> {
        Ok(self.records())
    }

    fn save(&self, records: &[DeviceRecord]) -> std::result::Result<(), RegistryError> {
        if let Ok(mut inner) = self.inner.lock() {
            inner.records = records.to_vec();
            inner.saves += 1;
        }
        Ok(())
    }
}

/// Registered devices, keyed by normalized address.
pub struct Registry {
    devices: BTreeMap<String, Device>,
    store: Box<dyn RegistryStore>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Load every persisted device from `store`.
    ///
    /// Devices that were mid-pairing when saved come back as `NotPaired`.
    pub fn load(store: impl RegistryStore + 'static) -> Result<Self> {
        let records = store.load()?;
        let devices = records
            .into_iter()
            .map(Device::from_record)
            .map(|d| (d.address.clone(), d))
            .collect::<BTreeMap<_, _>>();
        info!("Loaded {} registered device(s)", devices.len());
        Ok(Self {
            devices,
            store: Box::new(store),
        })
    }

    /// Empty registry backed by a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self {
            devices: BTreeMap::new(),
            store: Box::new(MemoryStore::new()),
        }
    }

    /// Rewrite the persisted document from the current devices.
    pub fn save(&self) -> Result<()> {
        let records: Vec<_> = self.devices.values().map(Device::to_record).collect();
        self.store.save(&records)?;
        debug!("Saved {} device(s)", records.len());
        Ok(())
    }

    pub fn get(&self, address: &str) -> Option<&Device> {
        self.devices.get(&normalize_address(address))
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut Device> {
        self.devices.get_mut(&normalize_address(address))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.devices.contains_key(&normalize_address(address))
    }

    /// Insert or replace a device.
    pub fn insert(&mut self, device: Device) -> Option<Device> {
        self.devices.insert(device.address.clone(), device)
    }

    pub fn remove(&mut self, address: &str) -> Option<Device> {
        self.devices.remove(&normalize_address(address))
    }

    /// Devices in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_truncate_name_on_char_boundary() {
        assert_eq!(truncate_name("Aranet4 1A2B3"), "Aranet4 1A2B3");
        let long = "Aranet4 living room sensor";
        assert_eq!(truncate_name(long).len(), MAX_NAME_BYTES);
        // 22 ASCII bytes then a 2-byte character straddling the limit.
        let name = format!("{}é", "a".repeat(22));
        assert_eq!(truncate_name(&name), "a".repeat(22));
    }

    #[test]
    fn test_json_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("devices.json");
        let store = JsonFileStore::new(&path);
        assert!(store.load().unwrap().is_empty());

        let mut registry = Registry::load(store.clone()).unwrap();
        let mut device = Device::new("aa:bb:cc:dd:ee:ff", "Aranet4 1A2B3", Family::Aranet4);
        device.flags.history_enabled = true;
        device.pairing = PairingState::Paired;
        device.pending_history = 12;
        registry.insert(device);
        registry.save().unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let first = &raw["devices"][0];
        assert_eq!(first["mac"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(first["settings"]["paired"], true);
        assert_eq!(first["settings"]["history"], true);
        assert_eq!(first["settings"]["gatt"], false);

        let reloaded = Registry::load(JsonFileStore::new(&path)).unwrap();
        let device = reloaded.get("AA:BB:CC:DD:EE:FF").unwrap();
        assert!(device.is_paired());
        assert_eq!(device.pending_history, 12);
        assert_eq!(device.family, Family::Aranet4);
        assert!(device.last_updated.is_none());
    }

    #[test]
    fn test_load_minimal_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(
            &path,
            r#"{"devices":[{"mac":"11:22:33:44:55:66","name":"Kitchen","settings":{"enabled":true}}]}"#,
        )
        .unwrap();

        let registry = Registry::load(JsonFileStore::new(&path)).unwrap();
        let device = registry.get("11:22:33:44:55:66").unwrap();
        assert_eq!(device.family, Family::Unknown);
        assert!(device.flags.enabled);
        assert!(!device.flags.gatt_allowed);
        assert_eq!(device.pairing, PairingState::NotPaired);
    }

    #[test]
    fn test_malformed_document_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Registry::load(JsonFileStore::new(&path)).is_err());
    }

    #[test]
    fn test_mid_pairing_not_persisted_as_paired() {
        let store = MemoryStore::new();
        let mut registry = Registry::load(store.clone()).unwrap();
        let mut device = Device::new("AA", "Aranet4 X", Family::Aranet4);
        device.pairing = PairingState::Pairing;
        registry.insert(device);
        registry.save().unwrap();

        assert_eq!(store.save_count(), 1);
        assert!(!store.records()[0].settings.paired);
    }

    #[test]
    fn test_lookup_normalizes_address() {
        let mut registry = Registry::in_memory();
        registry.insert(Device::new("aa:bb", "x", Family::Aranet2));
        assert!(registry.contains(" AA:BB"));
        assert!(registry.get_mut("aa:bb").is_some());
        assert!(registry.remove("Aa:Bb").is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expected_next() {
        let mut device = Device::new("AA", "Aranet4", Family::Aranet4);
        assert!(device.expected_next().is_none());

        let now = Instant::now();
        device.last_updated = Some(now);
        device.last_reading = Some(Reading {
            family: Family::Aranet4,
            measurement: blebridge_types::Measurement::Ambient {
                temperature: 2000,
                humidity: 400,
            },
            battery: 90,
            interval: 60,
            age: 5,
        });
        assert_eq!(
            device.expected_next(),
            Some(now + std::time::Duration::from_secs(55))
        );
    }
}
