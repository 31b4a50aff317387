//! Per-DID codecs. Each codec decodes one ReadDataByIdentifier response
//! payload into named fields; offsets and scale factors are fixed per
//! DID, not data-driven like the J1939 decoder.

use std::collections::BTreeMap;

use crate::error::GatewayError;

pub const DID_ENGINE: u16 = 0x0102;
pub const DID_FUEL_RATE: u16 = 0x013F;
pub const DID_FUEL_LEVEL: u16 = 0x0173;

/// Decode a DID response payload into column-sorted named fields. Rejects
/// DIDs outside the registry so an unexpected identifier surfaces as an
/// error rather than silently decoding garbage.
pub fn decode_did(did: u16, payload: &[u8]) -> Result<BTreeMap<String, f64>, GatewayError> {
    match did {
        DID_ENGINE => decode_engine(payload),
        DID_FUEL_RATE => decode_fuel_rate(payload),
        DID_FUEL_LEVEL => decode_fuel_level(payload),
        other => Err(GatewayError::Decode(format!("unknown UDS DID {other:#06x}"))),
    }
}

fn require_len(payload: &[u8], min_len: usize, did: u16) -> Result<(), GatewayError> {
    if payload.len() < min_len {
        return Err(GatewayError::Decode(format!(
            "DID {did:#06x} payload too short: got {} bytes, need {min_len}",
            payload.len()
        )));
    }
    Ok(())
}

/// 0x0102 — engine block: rpm, torque, vehicle speed.
fn decode_engine(payload: &[u8]) -> Result<BTreeMap<String, f64>, GatewayError> {
    require_len(payload, 39, DID_ENGINE)?;
    let rpm = u16::from_be_bytes([payload[21], payload[22]]) as f64 / 8.0;
    let torque = payload[38] as f64 - 125.0;
    let speed = u16::from_be_bytes([payload[23], payload[24]]) as f64 * 0.00390625;

    let mut out = BTreeMap::new();
    out.insert("rpm".to_string(), rpm);
    out.insert("torque".to_string(), torque);
    out.insert("speed".to_string(), speed);
    Ok(out)
}

/// 0x013F — fuel rate, unit L/h (named `fuel_rate`, scale 0.05).
fn decode_fuel_rate(payload: &[u8]) -> Result<BTreeMap<String, f64>, GatewayError> {
    require_len(payload, 2, DID_FUEL_RATE)?;
    let fuel_rate = u16::from_be_bytes([payload[0], payload[1]]) as f64 * 0.05;
    let mut out = BTreeMap::new();
    out.insert("fuel_rate".to_string(), fuel_rate);
    Ok(out)
}

/// 0x0173 — fuel level percentage, byte 11 scaled by 0.4.
fn decode_fuel_level(payload: &[u8]) -> Result<BTreeMap<String, f64>, GatewayError> {
    require_len(payload, 12, DID_FUEL_LEVEL)?;
    let fuel_level = payload[11] as f64 * 0.4;
    let mut out = BTreeMap::new();
    out.insert("fuel_level".to_string(), fuel_level);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_payload() -> Vec<u8> {
        let mut payload = vec![0u8; 39];
        payload[21] = 0x03;
        payload[22] = 0x20; // 0x0320 / 8 = 100.0 rpm
        payload[23] = 0x3C;
        payload[24] = 0x00; // 0x3C00 * 0.00390625 = 60.0 km/h
        payload[38] = 0xF0; // 240 - 125 = 115.0
        payload
    }

    #[test]
    fn engine_block_decodes_per_spec_vector() {
        let decoded = decode_did(DID_ENGINE, &engine_payload()).unwrap();
        assert_eq!(decoded["rpm"], 100.0);
        assert_eq!(decoded["torque"], 115.0);
        assert_eq!(decoded["speed"], 60.0);
    }

    #[test]
    fn fuel_rate_scales_by_point_zero_five() {
        let decoded = decode_did(DID_FUEL_RATE, &[0x00, 0x64]).unwrap(); // 100 * 0.05 = 5.0
        assert_eq!(decoded["fuel_rate"], 5.0);
    }

    #[test]
    fn fuel_level_reads_byte_eleven() {
        let mut payload = vec![0u8; 20];
        payload[11] = 100; // 100 * 0.4 = 40.0
        let decoded = decode_did(DID_FUEL_LEVEL, &payload).unwrap();
        assert_eq!(decoded["fuel_level"], 40.0);
    }

    #[test]
    fn unknown_did_is_rejected() {
        assert!(decode_did(0x9999, &[0u8; 8]).is_err());
    }

    #[test]
    fn short_payload_is_rejected() {
        assert!(decode_did(DID_FUEL_RATE, &[0x00]).is_err());
    }
}
