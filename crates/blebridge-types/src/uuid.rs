//! Bluetooth UUIDs and manufacturer identifiers for the supported sensors.

use uuid::{Uuid, uuid};

// --- Manufacturer identifiers ---

/// SAF Tehnika (Aranet) manufacturer ID in BLE advertisements.
pub const SAF_MANUFACTURER_ID: u16 = 0x0702;

/// Ruuvi Innovations manufacturer ID in BLE advertisements.
pub const RUUVI_MANUFACTURER_ID: u16 = 0x0499;

// --- SAF Tehnika (Aranet) ---

/// SAF Tehnika service UUID for firmware v1.2.0 and newer.
pub const SAF_SERVICE_NEW: Uuid = uuid!("0000fce0-0000-1000-8000-00805f9b34fb");

/// SAF Tehnika service UUID for firmware versions before v1.2.0.
pub const SAF_SERVICE_OLD: Uuid = uuid!("f0cd1400-95da-4f4b-9ac8-aa55d312af0c");

/// Current readings, Aranet4 layout.
pub const CURRENT_READINGS_DETAIL: Uuid = uuid!("f0cd3001-95da-4f4b-9ac8-aa55d312af0c");

/// Current readings, Aranet2 and Radiation layouts.
pub const CURRENT_READINGS_DETAIL_ALT: Uuid = uuid!("f0cd3003-95da-4f4b-9ac8-aa55d312af0c");

/// Number of records stored on the device.
pub const TOTAL_READINGS: Uuid = uuid!("f0cd2001-95da-4f4b-9ac8-aa55d312af0c");

/// Measurement interval in seconds.
pub const READ_INTERVAL: Uuid = uuid!("f0cd2002-95da-4f4b-9ac8-aa55d312af0c");

/// Seconds since the last measurement.
pub const SECONDS_SINCE_UPDATE: Uuid = uuid!("f0cd2004-95da-4f4b-9ac8-aa55d312af0c");

/// History response characteristic (V2, read-based).
pub const HISTORY_V2: Uuid = uuid!("f0cd2005-95da-4f4b-9ac8-aa55d312af0c");

/// Command characteristic.
pub const COMMAND: Uuid = uuid!("f0cd1402-95da-4f4b-9ac8-aa55d312af0c");

// --- Airvalent ---

/// Airvalent primary service.
pub const AIRVALENT_SERVICE: Uuid = uuid!("b81c94a4-6b2b-4d41-9357-0c8229ea02df");

/// Airvalent bit-packed readings characteristic. Battery percent trails the
/// six packed bytes on firmware that reports it.
pub const AIRVALENT_READINGS: Uuid = uuid!("e8694d30-a155-4fb4-befa-548e64c88965");

/// Airvalent measurement interval characteristic (u16 LE seconds).
pub const AIRVALENT_INTERVAL: Uuid = uuid!("b1c48eea-4f5c-44f7-9797-73e0ce294881");

// --- Standard GAP ---

/// Generic Access Profile service.
pub const GAP_SERVICE: Uuid = uuid!("00001800-0000-1000-8000-00805f9b34fb");

/// Device name characteristic.
pub const DEVICE_NAME: Uuid = uuid!("00002a00-0000-1000-8000-00805f9b34fb");
