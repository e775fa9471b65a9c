use anyhow::{Result, bail};

pub const PAYLOAD_MIN_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedPayload {
    pub temperature_celsius: f64,
    pub humidity_percent: u8,
}

/// Decodes a notification from the data characteristic.
///
/// Bytes 0..2 hold the temperature in centidegrees as a little-endian `i16`,
/// byte 2 holds the relative humidity. Anything after that is ignored.
pub fn decode_payload(payload: &[u8]) -> Result<DecodedPayload> {
    if payload.len() < PAYLOAD_MIN_LEN {
        bail!(
            "payload too short: expected at least {PAYLOAD_MIN_LEN} bytes, got {}",
            payload.len()
        )
    }

    let temperature_celsius = decode_temperature([payload[0], payload[1]]);
    let humidity_percent = payload[2];

    Ok(DecodedPayload {
        temperature_celsius,
        humidity_percent,
    })
}

fn decode_temperature(v: [u8; 2]) -> f64 {
    f64::from(i16::from_le_bytes(v)) / 100f64
}
