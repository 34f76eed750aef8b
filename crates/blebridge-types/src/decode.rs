//! Pure decoders for advertisement and GATT payloads.
//!
//! Every decoder checks the buffer length before reading through
//! [`bytes::Buf`], so no length or count field inside a payload can make it
//! read past the slice it was given. Decoders never touch device state; a
//! failure leaves the caller's previous reading in place.
//!
//! Manufacturer payloads are passed without the two-byte manufacturer id.

use bytes::Buf;

use crate::error::{ParseError, ParseResult};
use crate::types::{Family, HistorySample, Measurement, Reading};

/// Aranet beacon header bytes ahead of the Aranet4 sensor block.
pub const ARANET4_BEACON_HEADER: usize = 8;
/// Header plus the 9-byte sensor block (co2, temp, pressure, humidity, battery, status).
pub const MIN_ARANET4_BEACON_BYTES: usize = ARANET4_BEACON_HEADER + 9;
/// Type byte plus a 19-byte body.
pub const MIN_ARANET2_BEACON_BYTES: usize = 20;
/// Type byte plus a 21-byte body.
pub const MIN_RADIATION_BEACON_BYTES: usize = 22;
/// Ruuvi data format 5, format byte through MAC.
pub const BEACON_TAG_BYTES: usize = 24;

pub const ARANET4_GATT_BYTES: usize = 13;
pub const ARANET2_GATT_BYTES: usize = 7;
pub const RADIATION_GATT_BYTES: usize = 28;
pub const MIN_AIRVALENT_GATT_BYTES: usize = 6;

/// Bytes in a history V2 response header.
pub const HISTORY_V2_HEADER_BYTES: usize = 10;

/// Aranet beacon type prefixes. Aranet4 carries none.
pub const ARANET2_TYPE: u8 = 0x01;
pub const RADIATION_TYPE: u8 = 0x02;
pub const RADON_TYPE: u8 = 0x03;

/// Ruuvi data format handled by [`decode_beacon_tag`].
pub const RUUVI_RAWV2_FORMAT: u8 = 0x05;

const INTEGRATIONS_FLAG: u8 = 1 << 5;

/// Minimum manufacturer payload length for a family's beacon, if it has one.
#[must_use]
pub fn min_beacon_len(family: Family) -> Option<usize> {
    match family {
        Family::Aranet4 => Some(MIN_ARANET4_BEACON_BYTES),
        Family::Aranet2 => Some(MIN_ARANET2_BEACON_BYTES),
        Family::Radiation => Some(MIN_RADIATION_BEACON_BYTES),
        Family::BeaconTag => Some(BEACON_TAG_BYTES),
        Family::Airvalent | Family::Unknown => None,
    }
}

/// Decode a manufacturer payload for `family`.
///
/// # Errors
///
/// [`ParseError::UnsupportedFormat`] for families without a beacon, otherwise
/// whatever the family decoder reports.
pub fn decode_beacon(family: Family, payload: &[u8]) -> ParseResult<Reading> {
    match family {
        Family::Aranet4 => decode_aranet4_beacon(payload),
        Family::Aranet2 => decode_aranet2_beacon(payload),
        Family::Radiation => decode_radiation_beacon(payload),
        Family::BeaconTag => decode_beacon_tag(payload),
        Family::Airvalent | Family::Unknown => {
            Err(ParseError::UnsupportedFormat(payload.first().copied().unwrap_or(0)))
        }
    }
}

/// Decode the readings characteristic of a connected device.
///
/// Aranet2 and Airvalent layouts carry no age; Airvalent also carries no
/// interval. Those fields come back as 0 for the caller to fill from their
/// own characteristics.
///
/// # Errors
///
/// [`ParseError::UnsupportedFormat`] for families without GATT readings,
/// otherwise whatever the family decoder reports.
pub fn decode_gatt(family: Family, payload: &[u8]) -> ParseResult<Reading> {
    match family {
        Family::Aranet4 => decode_aranet4_gatt(payload),
        Family::Aranet2 => decode_aranet2_gatt(payload),
        Family::Radiation => decode_radiation_gatt(payload),
        Family::Airvalent => decode_airvalent_gatt(payload),
        Family::BeaconTag | Family::Unknown => {
            Err(ParseError::UnsupportedFormat(payload.first().copied().unwrap_or(0)))
        }
    }
}

/// 1/20 °C raw value to 0.01 °C, saturating.
pub(crate) fn twentieths_to_centi(raw: u16) -> i16 {
    i16::try_from(u32::from(raw) * 5).unwrap_or(i16::MAX)
}

fn temperature_from_twentieths(raw: u16) -> ParseResult<i16> {
    i16::try_from(u32::from(raw) * 5).map_err(|_| ParseError::OutOfRange {
        field: "temperature",
        value: i64::from(raw),
    })
}

fn check_co2(co2: u16) -> ParseResult<u16> {
    if co2 == 0 || co2 >= 0x8000 {
        return Err(ParseError::OutOfRange {
            field: "co2",
            value: i64::from(co2),
        });
    }
    Ok(co2)
}

fn check_integrations(flags: u8) -> ParseResult<()> {
    if flags & INTEGRATIONS_FLAG == 0 {
        return Err(ParseError::IntegrationsDisabled);
    }
    Ok(())
}

/// Read a little-endian u16 when at least two bytes remain.
fn optional_u16(buf: &mut &[u8]) -> Option<u16> {
    (buf.remaining() >= 2).then(|| buf.get_u16_le())
}

/// Aranet4 beacon.
///
/// - bytes 0-7: header, byte 0 is the flags byte (bit 5: integrations enabled)
/// - bytes 8-9: CO2 (ppm)
/// - bytes 10-11: temperature (1/20 °C)
/// - bytes 12-13: pressure (0.1 hPa)
/// - byte 14: humidity (%)
/// - byte 15: battery (%)
/// - byte 16: status
/// - bytes 17-20: interval and age (s), when present
/// - byte 21: counter, when present
///
/// # Errors
///
/// Short buffer, integrations disabled, or a CO2/temperature sentinel.
pub fn decode_aranet4_beacon(data: &[u8]) -> ParseResult<Reading> {
    ParseError::check_len(data, MIN_ARANET4_BEACON_BYTES)?;
    check_integrations(data[0])?;

    let mut buf = &data[ARANET4_BEACON_HEADER..];
    let co2 = check_co2(buf.get_u16_le())?;
    let temperature = temperature_from_twentieths(buf.get_u16_le())?;
    let pressure = buf.get_u16_le();
    let humidity = u16::from(buf.get_u8()) * 10;
    let battery = buf.get_u8();
    let _status = buf.get_u8();
    let interval = optional_u16(&mut buf).unwrap_or(0);
    let age = optional_u16(&mut buf).unwrap_or(0);

    Ok(Reading {
        family: Family::Aranet4,
        measurement: Measurement::Co2Ambient {
            co2,
            temperature,
            pressure,
            humidity,
        },
        battery,
        interval,
        age,
    })
}

/// Aranet2 beacon, including the leading `0x01` type byte.
///
/// Body: 7 header bytes, temperature (1/20 °C), 2 unused bytes, humidity
/// (0.1 %), battery, status, interval, age, optional counter.
///
/// # Errors
///
/// Short buffer, wrong type byte, integrations disabled, or temperature overflow.
pub fn decode_aranet2_beacon(data: &[u8]) -> ParseResult<Reading> {
    ParseError::check_len(data, MIN_ARANET2_BEACON_BYTES)?;
    if data[0] != ARANET2_TYPE {
        return Err(ParseError::UnsupportedFormat(data[0]));
    }
    let body = &data[1..];
    check_integrations(body[0])?;

    let mut buf = &body[7..];
    let temperature = temperature_from_twentieths(buf.get_u16_le())?;
    let _unused = buf.get_u16_le();
    let humidity = buf.get_u16_le();
    let battery = buf.get_u8();
    let _status = buf.get_u8();
    let interval = buf.get_u16_le();
    let age = buf.get_u16_le();

    Ok(Reading {
        family: Family::Aranet2,
        measurement: Measurement::Ambient {
            temperature,
            humidity,
        },
        battery,
        interval,
        age,
    })
}

/// Aranet Radiation beacon, including the leading `0x02` type byte.
///
/// Body: 5 header bytes, total dose (u32 nSv), duration (u32 s), dose rate
/// (u16, units of 10 nSv/h), battery, status, interval, age, optional counter.
///
/// # Errors
///
/// Short buffer, wrong type byte, or integrations disabled.
pub fn decode_radiation_beacon(data: &[u8]) -> ParseResult<Reading> {
    ParseError::check_len(data, MIN_RADIATION_BEACON_BYTES)?;
    if data[0] != RADIATION_TYPE {
        return Err(ParseError::UnsupportedFormat(data[0]));
    }
    let body = &data[1..];
    check_integrations(body[0])?;

    let mut buf = &body[5..];
    let total = u64::from(buf.get_u32_le());
    let duration = u64::from(buf.get_u32_le());
    let rate = u32::from(buf.get_u16_le()) * 10;
    let battery = buf.get_u8();
    let _status = buf.get_u8();
    let interval = buf.get_u16_le();
    let age = buf.get_u16_le();

    Ok(Reading {
        family: Family::Radiation,
        measurement: Measurement::Radiation {
            rate,
            total,
            pulses: None,
            duration,
        },
        battery,
        interval,
        age,
    })
}

/// Ruuvi data format 5 (RAWv2), big-endian.
///
/// - byte 0: format (`0x05`)
/// - bytes 1-2: temperature, i16 × 0.005 °C (`0x8000` = absent)
/// - bytes 3-4: humidity, u16 × 0.0025 % (`0xFFFF` = absent)
/// - bytes 5-6: pressure, u16 Pa offset by 50 000 (`0xFFFF` = absent)
/// - bytes 7-12: acceleration x, y, z, i16 mG (`0x8000` = invalid)
/// - bytes 13-14: power info, battery mV in the top 11 bits (+1600)
/// - byte 15: movement counter
/// - bytes 16-17: measurement sequence
/// - bytes 18-23: MAC
///
/// # Errors
///
/// Short buffer, another data format, or an invalid acceleration axis.
pub fn decode_beacon_tag(data: &[u8]) -> ParseResult<Reading> {
    ParseError::check_len(data, BEACON_TAG_BYTES)?;

    let mut buf = data;
    let format = buf.get_u8();
    if format != RUUVI_RAWV2_FORMAT {
        return Err(ParseError::UnsupportedFormat(format));
    }

    let temperature = match buf.get_i16() {
        i16::MIN => None,
        raw => Some(raw / 2),
    };
    let humidity = match buf.get_u16() {
        u16::MAX => None,
        raw => Some(raw / 40),
    };
    let pressure = match buf.get_u16() {
        u16::MAX => None,
        raw => u16::try_from((u32::from(raw) + 50_000) / 10).ok(),
    };

    let mut accel = [0i16; 3];
    for (axis, slot) in ["accel_x", "accel_y", "accel_z"].into_iter().zip(&mut accel) {
        let raw = buf.get_i16();
        if raw == i16::MIN {
            return Err(ParseError::OutOfRange {
                field: axis,
                value: i64::from(raw),
            });
        }
        *slot = raw;
    }

    let battery_mv = (buf.get_u16() >> 5) + 1600;

    Ok(Reading {
        family: Family::BeaconTag,
        measurement: Measurement::Beacon {
            accel,
            temperature,
            humidity,
            pressure,
        },
        battery: battery_percent_from_millivolts(battery_mv),
        interval: 0,
        age: 0,
    })
}

/// Linear battery estimate: 2000 mV is empty, 3000 mV is full.
#[must_use]
pub fn battery_percent_from_millivolts(mv: u16) -> u8 {
    let clamped = mv.clamp(2000, 3000);
    u8::try_from((clamped - 2000) / 10).unwrap_or(100)
}

/// Aranet4 current readings characteristic (`f0cd3001`).
///
/// CO2, temperature, pressure, humidity (u8 %), battery, status, interval, age.
///
/// # Errors
///
/// Short buffer or a CO2/temperature sentinel.
pub fn decode_aranet4_gatt(data: &[u8]) -> ParseResult<Reading> {
    ParseError::check_len(data, ARANET4_GATT_BYTES)?;

    let mut buf = data;
    let co2 = check_co2(buf.get_u16_le())?;
    let temperature = temperature_from_twentieths(buf.get_u16_le())?;
    let pressure = buf.get_u16_le();
    let humidity = u16::from(buf.get_u8()) * 10;
    let battery = buf.get_u8();
    let _status = buf.get_u8();
    let interval = buf.get_u16_le();
    let age = buf.get_u16_le();

    Ok(Reading {
        family: Family::Aranet4,
        measurement: Measurement::Co2Ambient {
            co2,
            temperature,
            pressure,
            humidity,
        },
        battery,
        interval,
        age,
    })
}

/// Aranet2 current readings characteristic (`f0cd3003`).
///
/// Temperature, humidity (u8 %), battery, status, interval. No age.
///
/// # Errors
///
/// Short buffer or temperature overflow.
pub fn decode_aranet2_gatt(data: &[u8]) -> ParseResult<Reading> {
    ParseError::check_len(data, ARANET2_GATT_BYTES)?;

    let mut buf = data;
    let temperature = temperature_from_twentieths(buf.get_u16_le())?;
    let humidity = u16::from(buf.get_u8()) * 10;
    let battery = buf.get_u8();
    let _status = buf.get_u8();
    let interval = buf.get_u16_le();

    Ok(Reading {
        family: Family::Aranet2,
        measurement: Measurement::Ambient {
            temperature,
            humidity,
        },
        battery,
        interval,
        age: 0,
    })
}

/// Aranet Radiation current readings characteristic (`f0cd3003`).
///
/// Header u16, interval, age, battery, rate (u32 nSv/h), total (u64 nSv),
/// duration (u64 s), status.
///
/// # Errors
///
/// Short buffer.
pub fn decode_radiation_gatt(data: &[u8]) -> ParseResult<Reading> {
    ParseError::check_len(data, RADIATION_GATT_BYTES)?;

    let mut buf = data;
    let _header = buf.get_u16_le();
    let interval = buf.get_u16_le();
    let age = buf.get_u16_le();
    let battery = buf.get_u8();
    let rate = buf.get_u32_le();
    let total = buf.get_u64_le();
    let duration = buf.get_u64_le();

    Ok(Reading {
        family: Family::Radiation,
        measurement: Measurement::Radiation {
            rate,
            total,
            pulses: None,
            duration,
        },
        battery,
        interval,
        age,
    })
}

/// Airvalent bit-packed readings.
///
/// ```text
/// co2      = b0 | (b1 & 0x7F) << 8
/// temp     = (b1 >> 7) | b2 << 1          0.1 °C, negative when b3 bit 0 is set
/// humidity = (b3 >> 1) | (b4 & 0x03) << 7 0.1 %
/// pressure = (b4 >> 3) | (b5 & 0x3F) << 5 hPa
/// ```
///
/// A seventh byte, when present, is the battery percent.
///
/// # Errors
///
/// Short buffer or a CO2 sentinel (`0` or `0x7FFF`).
pub fn decode_airvalent_gatt(data: &[u8]) -> ParseResult<Reading> {
    ParseError::check_len(data, MIN_AIRVALENT_GATT_BYTES)?;

    let b: [u16; 6] = [
        u16::from(data[0]),
        u16::from(data[1]),
        u16::from(data[2]),
        u16::from(data[3]),
        u16::from(data[4]),
        u16::from(data[5]),
    ];

    let co2 = b[0] | (b[1] & 0x7F) << 8;
    if co2 == 0 || co2 == 0x7FFF {
        return Err(ParseError::OutOfRange {
            field: "co2",
            value: i64::from(co2),
        });
    }

    // 9 bits of 0.1 °C, scaled to 0.01 °C.
    let magnitude = ((b[1] >> 7) | b[2] << 1) as i16 * 10;
    let temperature = if b[3] & 0x01 != 0 {
        -magnitude
    } else {
        magnitude
    };
    let humidity = (b[3] >> 1) | (b[4] & 0x03) << 7;
    let pressure = ((b[4] >> 3) | (b[5] & 0x3F) << 5) * 10;
    let battery = data.get(6).copied().unwrap_or(0);

    Ok(Reading {
        family: Family::Airvalent,
        measurement: Measurement::Co2Ambient {
            co2,
            temperature,
            pressure,
            humidity,
        },
        battery,
        interval: 0,
        age: 0,
    })
}

/// Little-endian u16 characteristic value (interval, age, record count).
///
/// # Errors
///
/// Fewer than two bytes.
pub fn decode_u16_le(data: &[u8]) -> ParseResult<u16> {
    ParseError::check_len(data, 2)?;
    let mut buf = data;
    Ok(buf.get_u16_le())
}

/// Parameters of the SAF history V2 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HistoryParam {
    Temperature = 1,
    Humidity = 2,
    Pressure = 3,
    Co2 = 4,
}

impl HistoryParam {
    /// Every parameter an Aranet4 log record is made of.
    pub const ARANET4: [HistoryParam; 4] = [
        HistoryParam::Temperature,
        HistoryParam::Humidity,
        HistoryParam::Pressure,
        HistoryParam::Co2,
    ];

    /// Bytes per value in a response.
    #[must_use]
    pub fn value_size(self) -> usize {
        match self {
            HistoryParam::Humidity => 1,
            _ => 2,
        }
    }

    /// Command written to `COMMAND` to request values starting at the
    /// 1-based index `start`.
    #[must_use]
    pub fn request(self, start: u16) -> [u8; 4] {
        let [lo, hi] = start.to_le_bytes();
        [0x61, self as u8, lo, hi]
    }
}

/// A parsed history V2 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryResponse {
    /// Raw parameter byte; compare against the requested [`HistoryParam`].
    pub param: u8,
    pub interval: u16,
    pub total: u16,
    pub ago: u16,
    /// 1-based index of the first value.
    pub start: u16,
    /// Values in this response, never more than the payload holds.
    pub values: Vec<u16>,
}

impl HistoryResponse {
    /// Parse a response read from `HISTORY_V2`. `value_size` is 1 or 2.
    ///
    /// The header's count byte is clamped to the number of complete values
    /// actually present.
    ///
    /// # Errors
    ///
    /// A buffer shorter than the 10-byte header.
    pub fn parse(data: &[u8], value_size: usize) -> ParseResult<Self> {
        ParseError::check_len(data, HISTORY_V2_HEADER_BYTES)?;

        let mut buf = data;
        let param = buf.get_u8();
        let interval = buf.get_u16_le();
        let total = buf.get_u16_le();
        let ago = buf.get_u16_le();
        let start = buf.get_u16_le();
        let count = usize::from(buf.get_u8());

        let size = value_size.clamp(1, 2);
        let available = buf.remaining() / size;
        let values = (0..count.min(available))
            .map(|_| {
                if size == 1 {
                    u16::from(buf.get_u8())
                } else {
                    buf.get_u16_le()
                }
            })
            .collect();

        Ok(Self {
            param,
            interval,
            total,
            ago,
            start,
            values,
        })
    }
}

/// Assemble per-parameter value columns into log records. The result is as
/// long as the shortest column.
#[must_use]
pub fn zip_history(temperature: &[u16], humidity: &[u16], pressure: &[u16], co2: &[u16]) -> Vec<HistorySample> {
    temperature
        .iter()
        .zip(humidity)
        .zip(pressure)
        .zip(co2)
        .map(|(((&t, &h), &p), &c)| HistorySample {
            co2: c,
            temperature: t,
            pressure: p,
            humidity: u8::try_from(h).unwrap_or(u8::MAX),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Aranet4 beacon: 8-byte header with integrations on, then the sensor block.
    fn aranet4_beacon(co2: u16, temp_raw: u16, tail: &[u8]) -> Vec<u8> {
        let mut data = vec![0x22, 0x13, 0x04, 0x01, 0x00, 0x0C, 0x0F, 0x01];
        data.extend_from_slice(&co2.to_le_bytes());
        data.extend_from_slice(&temp_raw.to_le_bytes());
        data.extend_from_slice(&10132u16.to_le_bytes());
        data.extend_from_slice(&[45, 85, 1]);
        data.extend_from_slice(tail);
        data
    }

    #[test]
    fn test_aranet4_beacon_minimal_block() {
        let data = aranet4_beacon(815, 326, &[]);
        assert_eq!(data.len(), MIN_ARANET4_BEACON_BYTES);

        let reading = decode_aranet4_beacon(&data).unwrap();
        assert_eq!(reading.family, Family::Aranet4);
        assert_eq!(
            reading.measurement,
            Measurement::Co2Ambient {
                co2: 815,
                temperature: 1630,
                pressure: 10132,
                humidity: 450,
            }
        );
        assert_eq!(reading.battery, 85);
        assert_eq!(reading.interval, 0);
        assert_eq!(reading.age, 0);
    }

    #[test]
    fn test_aranet4_beacon_full() {
        let data = aranet4_beacon(1200, 450, &[0x3C, 0x00, 0x05, 0x00, 0x07]);
        let reading = decode_aranet4_beacon(&data).unwrap();
        assert_eq!(reading.interval, 60);
        assert_eq!(reading.age, 5);
        assert_eq!(reading.measurement.co2(), Some(1200));
    }

    #[test]
    fn test_aranet4_beacon_one_byte_short() {
        let data = aranet4_beacon(815, 326, &[]);
        assert_eq!(
            decode_aranet4_beacon(&data[..data.len() - 1]),
            Err(ParseError::InsufficientBytes {
                expected: 17,
                actual: 16
            })
        );
    }

    #[test]
    fn test_aranet4_beacon_integrations_disabled() {
        let mut data = aranet4_beacon(815, 326, &[]);
        data[0] &= !INTEGRATIONS_FLAG;
        assert_eq!(
            decode_aranet4_beacon(&data),
            Err(ParseError::IntegrationsDisabled)
        );
    }

    #[test]
    fn test_aranet4_co2_sentinels() {
        for co2 in [0u16, 0x8000, 0xFFFF] {
            let data = aranet4_beacon(co2, 326, &[]);
            assert!(
                matches!(
                    decode_aranet4_beacon(&data),
                    Err(ParseError::OutOfRange { field: "co2", .. })
                ),
                "co2={co2:#x}"
            );
        }
    }

    #[test]
    fn test_aranet2_beacon() {
        let mut data = vec![ARANET2_TYPE, 0x20, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&420u16.to_le_bytes()); // 21.0 °C
        data.extend_from_slice(&[0, 0]);
        data.extend_from_slice(&512u16.to_le_bytes()); // 51.2 %
        data.extend_from_slice(&[93, 1]);
        data.extend_from_slice(&300u16.to_le_bytes());
        data.extend_from_slice(&42u16.to_le_bytes());
        assert_eq!(data.len(), MIN_ARANET2_BEACON_BYTES);

        let reading = decode_aranet2_beacon(&data).unwrap();
        assert_eq!(
            reading.measurement,
            Measurement::Ambient {
                temperature: 2100,
                humidity: 512
            }
        );
        assert_eq!(reading.battery, 93);
        assert_eq!(reading.interval, 300);
        assert_eq!(reading.age, 42);
    }

    #[test]
    fn test_radiation_beacon() {
        let mut data = vec![RADIATION_TYPE, 0x20, 0, 0, 0, 0];
        data.extend_from_slice(&1_500_000u32.to_le_bytes());
        data.extend_from_slice(&7200u32.to_le_bytes());
        data.extend_from_slice(&12u16.to_le_bytes());
        data.extend_from_slice(&[80, 1]);
        data.extend_from_slice(&600u16.to_le_bytes());
        data.extend_from_slice(&30u16.to_le_bytes());
        assert_eq!(data.len(), MIN_RADIATION_BEACON_BYTES);

        let reading = decode_radiation_beacon(&data).unwrap();
        assert_eq!(
            reading.measurement,
            Measurement::Radiation {
                rate: 120,
                total: 1_500_000,
                pulses: None,
                duration: 7200,
            }
        );
        assert_eq!(reading.interval, 600);
    }

    #[test]
    fn test_radiation_beacon_wrong_type() {
        let data = [0x07u8; MIN_RADIATION_BEACON_BYTES];
        assert_eq!(
            decode_radiation_beacon(&data),
            Err(ParseError::UnsupportedFormat(0x07))
        );
    }

    fn ruuvi_payload(accel_x: i16) -> Vec<u8> {
        // Reference vector from the RAWv2 format description.
        let mut data = vec![
            0x05, 0x12, 0xFC, 0x53, 0x94, 0xC3, 0x7C, 0x00, 0x04, 0xFF, 0xFC, 0x04, 0x0C, 0xAC,
            0x36, 0x42, 0x00, 0xCD, 0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F,
        ];
        data[7..9].copy_from_slice(&accel_x.to_be_bytes());
        data
    }

    #[test]
    fn test_beacon_tag_reference_vector() {
        let reading = decode_beacon_tag(&ruuvi_payload(4)).unwrap();
        assert_eq!(reading.family, Family::BeaconTag);
        assert_eq!(
            reading.measurement,
            Measurement::Beacon {
                accel: [4, -4, 1036],
                temperature: Some(2430),
                humidity: Some(534),
                pressure: Some(10004),
            }
        );
        // 0xAC36 >> 5 = 1377, + 1600 = 2977 mV
        assert_eq!(reading.battery, 97);
    }

    #[test]
    fn test_beacon_tag_invalid_accel() {
        assert!(matches!(
            decode_beacon_tag(&ruuvi_payload(i16::MIN)),
            Err(ParseError::OutOfRange {
                field: "accel_x",
                ..
            })
        ));
    }

    #[test]
    fn test_beacon_tag_absent_temperature() {
        let mut data = ruuvi_payload(0);
        data[1] = 0x80;
        data[2] = 0x00;
        let reading = decode_beacon_tag(&data).unwrap();
        assert_eq!(reading.measurement.temperature_celsius(), None);
    }

    #[test]
    fn test_beacon_tag_other_format() {
        let mut data = ruuvi_payload(0);
        data[0] = 0x03;
        assert_eq!(
            decode_beacon_tag(&data),
            Err(ParseError::UnsupportedFormat(0x03))
        );
    }

    #[test]
    fn test_battery_percent_clamps() {
        assert_eq!(battery_percent_from_millivolts(1900), 0);
        assert_eq!(battery_percent_from_millivolts(2500), 50);
        assert_eq!(battery_percent_from_millivolts(3300), 100);
    }

    #[test]
    fn test_aranet4_gatt() {
        let bytes: [u8; 13] = [
            0x20, 0x03, // CO2 = 800
            0xC2, 0x01, // 450 → 22.5 °C
            0x94, 0x27, // 1013.2 hPa
            45, 85, 1, // humidity, battery, status
            0x2C, 0x01, // interval 300
            0x78, 0x00, // age 120
        ];
        let reading = decode_gatt(Family::Aranet4, &bytes).unwrap();
        assert_eq!(reading.measurement.co2(), Some(800));
        assert_eq!(reading.measurement.temperature_celsius(), Some(22.5));
        assert_eq!(reading.interval, 300);
        assert_eq!(reading.age, 120);
    }

    #[test]
    fn test_aranet2_gatt() {
        let bytes = [0xA4, 0x01, 55, 90, 1, 0x3C, 0x00];
        let reading = decode_gatt(Family::Aranet2, &bytes).unwrap();
        assert_eq!(
            reading.measurement,
            Measurement::Ambient {
                temperature: 2100,
                humidity: 550
            }
        );
        assert_eq!(reading.interval, 60);
    }

    #[test]
    fn test_radiation_gatt() {
        let mut bytes = vec![0x04, 0x00];
        bytes.extend_from_slice(&60u16.to_le_bytes());
        bytes.extend_from_slice(&10u16.to_le_bytes());
        bytes.push(70);
        bytes.extend_from_slice(&95u32.to_le_bytes());
        bytes.extend_from_slice(&3_000_000u64.to_le_bytes());
        bytes.extend_from_slice(&86_400u64.to_le_bytes());
        bytes.push(1);
        assert_eq!(bytes.len(), RADIATION_GATT_BYTES);

        let reading = decode_gatt(Family::Radiation, &bytes).unwrap();
        assert_eq!(
            reading.measurement,
            Measurement::Radiation {
                rate: 95,
                total: 3_000_000,
                pulses: None,
                duration: 86_400,
            }
        );
        assert_eq!(reading.battery, 70);
        assert_eq!(reading.age, 10);
    }

    /// Pack values the way the Airvalent firmware does.
    fn airvalent_pack(co2: u16, temp: i16, hum: u16, pres: u16) -> [u8; 6] {
        let t = temp.unsigned_abs();
        let neg = u16::from(temp < 0);
        [
            (co2 & 0xFF) as u8,
            ((co2 >> 8) & 0x7F | (t & 0x01) << 7) as u8,
            ((t >> 1) & 0xFF) as u8,
            (neg | (hum & 0x7F) << 1) as u8,
            ((hum >> 7) & 0x03 | (pres & 0x1F) << 3) as u8,
            ((pres >> 5) & 0x3F) as u8,
        ]
    }

    #[test]
    fn test_airvalent_unpacking() {
        let data = airvalent_pack(612, 215, 433, 1009);
        let reading = decode_airvalent_gatt(&data).unwrap();
        assert_eq!(
            reading.measurement,
            Measurement::Co2Ambient {
                co2: 612,
                temperature: 2150,
                pressure: 10090,
                humidity: 433,
            }
        );
        assert_eq!(reading.battery, 0);
    }

    #[test]
    fn test_airvalent_negative_temperature_and_battery() {
        let mut data = airvalent_pack(500, -35, 800, 990).to_vec();
        data.push(64);
        let reading = decode_airvalent_gatt(&data).unwrap();
        assert_eq!(reading.measurement.temperature_celsius(), Some(-3.5));
        assert_eq!(reading.battery, 64);
    }

    #[test]
    fn test_airvalent_co2_sentinel() {
        let data = airvalent_pack(0x7FFF, 200, 400, 1000);
        assert!(matches!(
            decode_airvalent_gatt(&data),
            Err(ParseError::OutOfRange { field: "co2", .. })
        ));
    }

    #[test]
    fn test_decode_dispatch_rejects_families_without_layout() {
        assert!(matches!(
            decode_beacon(Family::Airvalent, &[1, 2, 3]),
            Err(ParseError::UnsupportedFormat(1))
        ));
        assert!(matches!(
            decode_gatt(Family::BeaconTag, &[]),
            Err(ParseError::UnsupportedFormat(0))
        ));
    }

    #[test]
    fn test_history_request_bytes() {
        assert_eq!(HistoryParam::Co2.request(0x0102), [0x61, 4, 0x02, 0x01]);
        assert_eq!(HistoryParam::Humidity.request(1), [0x61, 2, 1, 0]);
    }

    #[test]
    fn test_history_response_parse() {
        let mut data = vec![4];
        data.extend_from_slice(&60u16.to_le_bytes());
        data.extend_from_slice(&500u16.to_le_bytes());
        data.extend_from_slice(&12u16.to_le_bytes());
        data.extend_from_slice(&381u16.to_le_bytes());
        data.push(3);
        for v in [700u16, 710, 720] {
            data.extend_from_slice(&v.to_le_bytes());
        }

        let resp = HistoryResponse::parse(&data, 2).unwrap();
        assert_eq!(resp.param, 4);
        assert_eq!(resp.interval, 60);
        assert_eq!(resp.total, 500);
        assert_eq!(resp.start, 381);
        assert_eq!(resp.values, vec![700, 710, 720]);
    }

    #[test]
    fn test_history_response_count_larger_than_payload() {
        let mut data = vec![2, 60, 0, 10, 0, 0, 0, 1, 0, 200];
        data.extend_from_slice(&[40, 41, 42]);
        let resp = HistoryResponse::parse(&data, 1).unwrap();
        assert_eq!(resp.values, vec![40, 41, 42]);
    }

    #[test]
    fn test_zip_history_shortest_column() {
        let samples = zip_history(&[440, 441], &[40, 41], &[10000, 10001], &[600]);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].co2, 600);
        assert_eq!(samples[0].humidity, 40);
    }

    #[test]
    fn test_decoders_are_deterministic() {
        let data = aranet4_beacon(815, 326, &[]);
        assert_eq!(decode_aranet4_beacon(&data), decode_aranet4_beacon(&data));
    }
}
