//! Advertisement classification.
//!
//! Rules are tried in a fixed order and the first match wins:
//!
//! 1. manufacturer data (SAF Tehnika `0x0702`, Ruuvi `0x0499` format 5),
//! 2. advertised service UUIDs (Airvalent, SAF old/new),
//! 3. the advertised name.
//!
//! A manufacturer record shorter than its family's minimum beacon length is
//! not a match: classification moves on to the next rule and the payload is
//! never handed to a decoder.

use blebridge_types::decode::{
    ARANET2_TYPE, RADIATION_TYPE, RADON_TYPE, RUUVI_RAWV2_FORMAT, min_beacon_len,
};
use blebridge_types::uuid::{
    AIRVALENT_SERVICE, RUUVI_MANUFACTURER_ID, SAF_MANUFACTURER_ID, SAF_SERVICE_NEW,
    SAF_SERVICE_OLD,
};
use blebridge_types::Family;

use crate::host::Advertisement;

/// Result of classifying one advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification<'a> {
    pub family: Family,
    /// Manufacturer payload long enough for the family's beacon decoder.
    pub beacon: Option<&'a [u8]>,
}

impl Classification<'_> {
    const UNKNOWN: Self = Classification {
        family: Family::Unknown,
        beacon: None,
    };

    fn without_beacon(family: Family) -> Self {
        Classification {
            family,
            beacon: None,
        }
    }
}

/// Classify an advertisement. Pure; callers apply the result.
#[must_use]
pub fn classify(adv: &Advertisement) -> Classification<'_> {
    if let Some(found) = by_manufacturer(adv) {
        return found;
    }
    if let Some(family) = by_service(adv) {
        return Classification::without_beacon(family);
    }
    adv.name
        .as_deref()
        .and_then(Family::from_name)
        .map_or(Classification::UNKNOWN, Classification::without_beacon)
}

fn by_manufacturer(adv: &Advertisement) -> Option<Classification<'_>> {
    if let Some(payload) = adv.manufacturer_payload(SAF_MANUFACTURER_ID)
        && let Some(&lead) = payload.first()
    {
        let family = match lead {
            ARANET2_TYPE => Family::Aranet2,
            RADIATION_TYPE => Family::Radiation,
            // Radon: a real SAF device, just not one we decode.
            RADON_TYPE => return Some(Classification::UNKNOWN),
            _ => Family::Aranet4,
        };
        if let Some(found) = with_beacon(family, payload) {
            return Some(found);
        }
    }

    if let Some(payload) = adv.manufacturer_payload(RUUVI_MANUFACTURER_ID)
        && payload.first() == Some(&RUUVI_RAWV2_FORMAT)
    {
        return with_beacon(Family::BeaconTag, payload);
    }

    None
}

fn with_beacon(family: Family, payload: &[u8]) -> Option<Classification<'_>> {
    let min = min_beacon_len(family)?;
    (payload.len() >= min).then_some(Classification {
        family,
        beacon: Some(payload),
    })
}

fn by_service(adv: &Advertisement) -> Option<Family> {
    if adv.service_uuids.contains(&AIRVALENT_SERVICE) {
        return Some(Family::Airvalent);
    }
    let saf = adv
        .service_uuids
        .iter()
        .any(|u| *u == SAF_SERVICE_NEW || *u == SAF_SERVICE_OLD);
    if !saf {
        return None;
    }
    let from_name = adv.name.as_deref().and_then(Family::from_name);
    Some(match from_name {
        Some(f @ (Family::Aranet4 | Family::Aranet2 | Family::Radiation)) => f,
        _ => Family::Aranet4,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aranet4_payload() -> Vec<u8> {
        let mut data = vec![0x22, 0, 0, 0, 0, 0, 0, 0];
        data.extend_from_slice(&[0x2F, 0x03, 0x46, 0x01, 0x94, 0x27, 45, 85, 1]);
        data
    }

    #[test]
    fn test_aranet4_by_manufacturer() {
        let adv = Advertisement::new("01:02:03:04:05:06")
            .with_manufacturer_data(SAF_MANUFACTURER_ID, aranet4_payload());
        let c = classify(&adv);
        assert_eq!(c.family, Family::Aranet4);
        assert_eq!(c.beacon.map(<[u8]>::len), Some(17));
    }

    #[test]
    fn test_type_prefixes() {
        let adv = Advertisement::new("a").with_manufacturer_data(SAF_MANUFACTURER_ID, {
            let mut p = vec![ARANET2_TYPE];
            p.extend_from_slice(&[0x20; 19]);
            p
        });
        assert_eq!(classify(&adv).family, Family::Aranet2);

        let adv = Advertisement::new("a").with_manufacturer_data(SAF_MANUFACTURER_ID, {
            let mut p = vec![RADIATION_TYPE];
            p.extend_from_slice(&[0x20; 21]);
            p
        });
        assert_eq!(classify(&adv).family, Family::Radiation);

        let adv = Advertisement::new("a")
            .with_name("Aranet4 123")
            .with_manufacturer_data(SAF_MANUFACTURER_ID, vec![RADON_TYPE; 30]);
        assert_eq!(classify(&adv), Classification::UNKNOWN);
    }

    #[test]
    fn test_short_payload_never_reaches_decoder() {
        let adv = Advertisement::new("a")
            .with_manufacturer_data(SAF_MANUFACTURER_ID, vec![0x22, 0x13, 0x04]);
        assert_eq!(classify(&adv), Classification::UNKNOWN);

        // Falls through to the name rule, still without a beacon.
        let adv = adv.with_name("Aranet4 1A2B3");
        assert_eq!(
            classify(&adv),
            Classification {
                family: Family::Aranet4,
                beacon: None
            }
        );
    }

    #[test]
    fn test_ruuvi_format() {
        let mut payload = vec![RUUVI_RAWV2_FORMAT];
        payload.extend_from_slice(&[0; 23]);
        let adv = Advertisement::new("a").with_manufacturer_data(RUUVI_MANUFACTURER_ID, payload);
        assert_eq!(classify(&adv).family, Family::BeaconTag);

        let adv = Advertisement::new("a").with_manufacturer_data(RUUVI_MANUFACTURER_ID, vec![0x03; 14]);
        assert_eq!(classify(&adv).family, Family::Unknown);
    }

    #[test]
    fn test_service_rules() {
        let adv = Advertisement::new("a").with_service(AIRVALENT_SERVICE);
        assert_eq!(classify(&adv).family, Family::Airvalent);

        let adv = Advertisement::new("a").with_service(SAF_SERVICE_NEW);
        assert_eq!(classify(&adv).family, Family::Aranet4);

        let adv = Advertisement::new("a")
            .with_service(SAF_SERVICE_OLD)
            .with_name("Aranet2 Bedroom");
        assert_eq!(classify(&adv).family, Family::Aranet2);

        // Non-Aranet name on a SAF service still means an Aranet4.
        let adv = Advertisement::new("a")
            .with_service(SAF_SERVICE_NEW)
            .with_name("Ruuvi 1234");
        assert_eq!(classify(&adv).family, Family::Aranet4);
    }

    #[test]
    fn test_manufacturer_beats_name() {
        let adv = Advertisement::new("a")
            .with_name("Aranet2 kitchen")
            .with_manufacturer_data(SAF_MANUFACTURER_ID, aranet4_payload());
        assert_eq!(classify(&adv).family, Family::Aranet4);
    }

    #[test]
    fn test_name_rule_and_miss() {
        assert_eq!(
            classify(&Advertisement::new("a").with_name("Airvalent 77")).family,
            Family::Airvalent
        );
        assert_eq!(
            classify(&Advertisement::new("a").with_name("Headphones")),
            Classification::UNKNOWN
        );
        assert_eq!(classify(&Advertisement::new("a")), Classification::UNKNOWN);
    }
}
