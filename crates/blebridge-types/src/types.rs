//! Sensor families and the normalized reading model.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Family of a BLE sensor.
///
/// The family decides which decoder applies to a payload and what a device
/// can do once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Family {
    /// Not (yet) classified, or a family we do not decode.
    #[default]
    Unknown,
    /// Aranet4 CO2, temperature, humidity and pressure sensor.
    Aranet4,
    /// Aranet2 temperature and humidity sensor.
    Aranet2,
    /// Aranet Radiation dosimeter.
    Radiation,
    /// Airvalent CO2 monitor (GATT only).
    Airvalent,
    /// Ruuvi-compatible accelerometer beacon tag (advertisement only).
    BeaconTag,
}

impl Family {
    /// Detect the family from an advertised device name.
    ///
    /// Matching is case-insensitive and word-boundary aware, so
    /// `"NotAranet4Device"` does not match `aranet4`.
    ///
    /// ```
    /// use blebridge_types::Family;
    ///
    /// assert_eq!(Family::from_name("Aranet4 1A2B3"), Some(Family::Aranet4));
    /// assert_eq!(Family::from_name("Aranet2 Home"), Some(Family::Aranet2));
    /// assert_eq!(Family::from_name("Aranet Radiation"), Some(Family::Radiation));
    /// assert_eq!(Family::from_name("Ruuvi 4F2C"), Some(Family::BeaconTag));
    /// assert_eq!(Family::from_name("Kitchen lamp"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();

        [
            ("aranet4", Family::Aranet4),
            ("aranet2", Family::Aranet2),
            ("radiation", Family::Radiation),
            ("airvalent", Family::Airvalent),
            ("ruuvi", Family::BeaconTag),
        ]
        .into_iter()
        .find(|(word, _)| contains_word(&name, word))
        .map(|(_, family)| family)
    }

    /// Whether the device keeps an on-board log we can backfill from.
    #[must_use]
    pub fn supports_history(self) -> bool {
        matches!(self, Family::Aranet4)
    }

    /// Whether readings can be taken from advertisements without connecting.
    #[must_use]
    pub fn has_beacon(self) -> bool {
        matches!(
            self,
            Family::Aranet4 | Family::Aranet2 | Family::Radiation | Family::BeaconTag
        )
    }

    /// Whether readings can be taken over a GATT connection.
    #[must_use]
    pub fn has_gatt(self) -> bool {
        matches!(
            self,
            Family::Aranet4 | Family::Aranet2 | Family::Radiation | Family::Airvalent
        )
    }

    /// Characteristic carrying the current readings, for connectable families.
    #[must_use]
    pub fn readings_characteristic(self) -> Option<uuid::Uuid> {
        match self {
            Family::Aranet4 => Some(crate::uuid::CURRENT_READINGS_DETAIL),
            Family::Aranet2 | Family::Radiation => Some(crate::uuid::CURRENT_READINGS_DETAIL_ALT),
            Family::Airvalent => Some(crate::uuid::AIRVALENT_READINGS),
            Family::Unknown | Family::BeaconTag => None,
        }
    }

    /// Service that owns [`readings_characteristic`](Self::readings_characteristic).
    #[must_use]
    pub fn readings_service(self) -> Option<uuid::Uuid> {
        match self {
            Family::Aranet4 | Family::Aranet2 | Family::Radiation => {
                Some(crate::uuid::SAF_SERVICE_NEW)
            }
            Family::Airvalent => Some(crate::uuid::AIRVALENT_SERVICE),
            Family::Unknown | Family::BeaconTag => None,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Unknown => "Unknown",
            Family::Aranet4 => "Aranet4",
            Family::Aranet2 => "Aranet2",
            Family::Radiation => "Aranet Radiation",
            Family::Airvalent => "Airvalent",
            Family::BeaconTag => "Beacon tag",
        };
        f.write_str(name)
    }
}

/// Word-boundary substring match. A boundary is the start or end of the
/// string or any non-alphanumeric character.
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(pos, _)| {
        let before_ok = haystack[..pos]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[pos + needle.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}

/// Sensor values of one reading, in fixed-point units.
///
/// Temperatures are in 0.01 °C, humidity in 0.1 %, pressure in 0.1 hPa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Measurement {
    /// CO2 with ambient climate (Aranet4, Airvalent).
    Co2Ambient {
        /// CO2 concentration in ppm.
        co2: u16,
        temperature: i16,
        pressure: u16,
        humidity: u16,
    },
    /// Temperature and humidity only (Aranet2).
    Ambient { temperature: i16, humidity: u16 },
    /// Radiation dose (Aranet Radiation).
    Radiation {
        /// Dose rate in nSv/h.
        rate: u32,
        /// Accumulated dose in nSv.
        total: u64,
        /// Pulse count, when the layout carries one.
        pulses: Option<u32>,
        /// Accumulation duration in seconds.
        duration: u64,
    },
    /// Accelerometer beacon tag.
    Beacon {
        /// Acceleration on x, y, z in milli-g.
        accel: [i16; 3],
        temperature: Option<i16>,
        humidity: Option<u16>,
        pressure: Option<u16>,
    },
}

impl Measurement {
    /// CO2 in ppm, if measured.
    #[must_use]
    pub fn co2(&self) -> Option<u16> {
        match *self {
            Measurement::Co2Ambient { co2, .. } => Some(co2),
            _ => None,
        }
    }

    /// Temperature in °C, if measured.
    #[must_use]
    pub fn temperature_celsius(&self) -> Option<f64> {
        let centi = match *self {
            Measurement::Co2Ambient { temperature, .. }
            | Measurement::Ambient { temperature, .. } => Some(temperature),
            Measurement::Beacon { temperature, .. } => temperature,
            Measurement::Radiation { .. } => None,
        };
        centi.map(|t| f64::from(t) / 100.0)
    }

    /// Relative humidity in %, if measured.
    #[must_use]
    pub fn humidity_percent(&self) -> Option<f64> {
        let deci = match *self {
            Measurement::Co2Ambient { humidity, .. } | Measurement::Ambient { humidity, .. } => {
                Some(humidity)
            }
            Measurement::Beacon { humidity, .. } => humidity,
            Measurement::Radiation { .. } => None,
        };
        deci.map(|h| f64::from(h) / 10.0)
    }

    /// Pressure in hPa, if measured.
    #[must_use]
    pub fn pressure_hpa(&self) -> Option<f64> {
        let deci = match *self {
            Measurement::Co2Ambient { pressure, .. } => Some(pressure),
            Measurement::Beacon { pressure, .. } => pressure,
            Measurement::Ambient { .. } | Measurement::Radiation { .. } => None,
        };
        deci.map(|p| f64::from(p) / 10.0)
    }
}

/// A decoded reading: what a device measured plus housekeeping values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    pub family: Family,
    pub measurement: Measurement,
    /// Battery level in percent (0-100).
    pub battery: u8,
    /// Measurement interval in seconds; 0 when the payload does not carry it.
    pub interval: u16,
    /// Seconds since the device took this measurement.
    pub age: u16,
}

/// Numeric value of a [`Metric`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
        }
    }
}

/// What a metric is, independent of any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricInfo {
    /// Field / topic name, e.g. `co2` or `temperature`.
    pub name: &'static str,
    pub unit: &'static str,
    /// Home Assistant device class, when one fits.
    pub device_class: Option<&'static str>,
}

impl MetricInfo {
    const fn new(name: &'static str, unit: &'static str) -> Self {
        Self {
            name,
            unit,
            device_class: None,
        }
    }

    const fn class(mut self, device_class: &'static str) -> Self {
        self.device_class = Some(device_class);
        self
    }
}

const CO2: MetricInfo = MetricInfo::new("co2", "ppm").class("carbon_dioxide");
const TEMPERATURE: MetricInfo = MetricInfo::new("temperature", "°C").class("temperature");
const PRESSURE: MetricInfo = MetricInfo::new("pressure", "hPa").class("pressure");
const HUMIDITY: MetricInfo = MetricInfo::new("humidity", "%").class("humidity");
const RADIATION: MetricInfo = MetricInfo::new("radiation", "µSv/h");
const RADIATION_TOTAL: MetricInfo = MetricInfo::new("radiation_total", "mSv");
const DURATION: MetricInfo = MetricInfo::new("duration", "s");
const PULSES: MetricInfo = MetricInfo::new("pulses", "");
const ACCEL: [MetricInfo; 3] = [
    MetricInfo::new("accel_x", "g"),
    MetricInfo::new("accel_y", "g"),
    MetricInfo::new("accel_z", "g"),
];
const BATTERY: MetricInfo = MetricInfo::new("battery", "%").class("battery");
const INTERVAL: MetricInfo = MetricInfo::new("interval", "s");
const AGO: MetricInfo = MetricInfo::new("ago", "s");

const CO2_AMBIENT_METRICS: &[MetricInfo] = &[CO2, TEMPERATURE, PRESSURE, HUMIDITY, BATTERY];
const AMBIENT_METRICS: &[MetricInfo] = &[TEMPERATURE, HUMIDITY, BATTERY];
const RADIATION_METRICS: &[MetricInfo] = &[RADIATION, RADIATION_TOTAL, DURATION, BATTERY];
const BEACON_METRICS: &[MetricInfo] = &[
    TEMPERATURE,
    PRESSURE,
    HUMIDITY,
    ACCEL[0],
    ACCEL[1],
    ACCEL[2],
    BATTERY,
];

impl Family {
    /// Sensor metrics a device of this family reports, in the order of
    /// [`Reading::sensor_metrics`]. Values a particular reading lacks (an
    /// absent beacon temperature) may be missing from that reading.
    #[must_use]
    pub fn sensor_metrics(self) -> &'static [MetricInfo] {
        match self {
            Family::Aranet4 | Family::Airvalent => CO2_AMBIENT_METRICS,
            Family::Aranet2 => AMBIENT_METRICS,
            Family::Radiation => RADIATION_METRICS,
            Family::BeaconTag => BEACON_METRICS,
            Family::Unknown => &[],
        }
    }
}

/// One named value of a reading in display units, as sinks publish it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metric {
    /// Field / topic name, e.g. `co2` or `temperature`.
    pub name: &'static str,
    pub value: MetricValue,
    pub unit: &'static str,
    /// Home Assistant device class, when one fits.
    pub device_class: Option<&'static str>,
}

impl Metric {
    const fn new(info: MetricInfo, value: MetricValue) -> Self {
        Self {
            name: info.name,
            value,
            unit: info.unit,
            device_class: info.device_class,
        }
    }

    const fn int(info: MetricInfo, value: i64) -> Self {
        Self::new(info, MetricValue::Int(value))
    }

    const fn float(info: MetricInfo, value: f64) -> Self {
        Self::new(info, MetricValue::Float(value))
    }

    #[must_use]
    pub fn info(&self) -> MetricInfo {
        MetricInfo {
            name: self.name,
            unit: self.unit,
            device_class: self.device_class,
        }
    }
}

impl Reading {
    /// Sensor values in display units (°C, %, hPa, µSv/h, mSv, g) plus battery.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sensor_metrics(&self) -> Vec<Metric> {
        let mut out = Vec::with_capacity(8);
        let m = &self.measurement;

        if let Some(co2) = m.co2() {
            out.push(Metric::int(CO2, i64::from(co2)));
        }
        if let Some(t) = m.temperature_celsius() {
            out.push(Metric::float(TEMPERATURE, t));
        }
        if let Some(p) = m.pressure_hpa() {
            out.push(Metric::float(PRESSURE, p));
        }
        if let Some(h) = m.humidity_percent() {
            out.push(Metric::float(HUMIDITY, h));
        }
        match *m {
            Measurement::Radiation {
                rate,
                total,
                pulses,
                duration,
            } => {
                out.push(Metric::float(RADIATION, f64::from(rate) / 1000.0));
                out.push(Metric::float(RADIATION_TOTAL, total as f64 / 1_000_000.0));
                out.push(Metric::int(
                    DURATION,
                    i64::try_from(duration).unwrap_or(i64::MAX),
                ));
                if let Some(pulses) = pulses {
                    out.push(Metric::int(PULSES, i64::from(pulses)));
                }
            }
            Measurement::Beacon { accel, .. } => {
                for (info, milli_g) in ACCEL.into_iter().zip(accel) {
                    out.push(Metric::float(info, f64::from(milli_g) / 1000.0));
                }
            }
            Measurement::Co2Ambient { .. } | Measurement::Ambient { .. } => {}
        }
        out.push(Metric::int(BATTERY, i64::from(self.battery)));
        out
    }

    /// Every field of the reading: [`sensor_metrics`](Self::sensor_metrics)
    /// followed by `interval` and `ago`.
    #[must_use]
    pub fn metrics(&self) -> Vec<Metric> {
        let mut out = self.sensor_metrics();
        out.push(Metric::int(INTERVAL, i64::from(self.interval)));
        out.push(Metric::int(AGO, i64::from(self.age)));
        out
    }
}

/// One record of an Aranet4 on-board log, in raw device units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HistorySample {
    pub co2: u16,
    /// Raw temperature, 1/20 °C.
    pub temperature: u16,
    /// Raw pressure, 0.1 hPa.
    pub pressure: u16,
    /// Humidity in whole percent.
    pub humidity: u8,
}

impl HistorySample {
    /// Normalize into a [`Reading`]. History carries no battery level, so it
    /// is reported as the battery of the current reading.
    #[must_use]
    pub fn into_reading(self, interval: u16, battery: u8) -> Reading {
        Reading {
            family: Family::Aranet4,
            measurement: Measurement::Co2Ambient {
                co2: self.co2,
                temperature: crate::decode::twentieths_to_centi(self.temperature),
                pressure: self.pressure,
                humidity: u16::from(self.humidity) * 10,
            },
            battery,
            interval,
            age: 0,
        }
    }
}
