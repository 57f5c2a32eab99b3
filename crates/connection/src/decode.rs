//! GATT notification payload decoders
//!
//! Pure functions over notification bytes, shared by the BLE transport and
//! its tests. Each decoder returns the metric values it found.

use bytes::Buf;
use contracts::MetricKey;
use thiserror::Error;

/// Payload decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{characteristic} payload truncated: needed {needed} more bytes, {remaining} left")]
    Truncated {
        characteristic: &'static str,
        needed: usize,
        remaining: usize,
    },
}

fn ensure(buf: &[u8], needed: usize, characteristic: &'static str) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            characteristic,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Heart Rate Measurement (0x2A37). Bit 0 of the flags selects a u16 value.
pub fn decode_heart_rate(mut payload: &[u8]) -> Result<Vec<(MetricKey, f64)>, DecodeError> {
    const NAME: &str = "heart rate";
    ensure(payload, 1, NAME)?;
    let flags = payload.get_u8();

    let bpm = if flags & 0x01 != 0 {
        ensure(payload, 2, NAME)?;
        payload.get_u16_le() as f64
    } else {
        ensure(payload, 1, NAME)?;
        payload.get_u8() as f64
    };
    Ok(vec![(MetricKey::HeartRate, bpm)])
}

mod ftms {
    pub const SPEED: u16 = 0x0002;
    pub const AVERAGE_SPEED: u16 = 0x0004;
    pub const POWER: u16 = 0x0010;
    pub const AVERAGE_POWER: u16 = 0x0020;
    pub const EXPENDED_ENERGY: u16 = 0x0040;
    pub const HEART_RATE: u16 = 0x0080;
    pub const METABOLIC_EQUIVALENT: u16 = 0x0100;
    pub const ELAPSED_TIME: u16 = 0x0200;
    pub const REMAINING_TIME: u16 = 0x0400;
    pub const CADENCE: u16 = 0x0800;
}

/// FTMS Indoor Bike Data (0x2AD2): speed (0.01 km/h), power (W) and
/// cadence (0.5 rpm), skipping the fields in between.
pub fn decode_indoor_bike(mut payload: &[u8]) -> Result<Vec<(MetricKey, f64)>, DecodeError> {
    const NAME: &str = "indoor bike data";
    ensure(payload, 2, NAME)?;
    let flags = payload.get_u16_le();
    let mut values = Vec::with_capacity(3);

    if flags & ftms::SPEED != 0 {
        ensure(payload, 2, NAME)?;
        values.push((MetricKey::Speed, payload.get_u16_le() as f64 / 100.0));
    }
    skip(&mut payload, flags, ftms::AVERAGE_SPEED, 2, NAME)?;

    if flags & ftms::POWER != 0 {
        ensure(payload, 2, NAME)?;
        values.push((MetricKey::Power, payload.get_u16_le() as f64));
    }
    skip(&mut payload, flags, ftms::AVERAGE_POWER, 2, NAME)?;
    skip(&mut payload, flags, ftms::EXPENDED_ENERGY, 3, NAME)?;
    skip(&mut payload, flags, ftms::HEART_RATE, 1, NAME)?;
    skip(&mut payload, flags, ftms::METABOLIC_EQUIVALENT, 1, NAME)?;
    skip(&mut payload, flags, ftms::ELAPSED_TIME, 2, NAME)?;
    skip(&mut payload, flags, ftms::REMAINING_TIME, 2, NAME)?;

    if flags & ftms::CADENCE != 0 {
        ensure(payload, 2, NAME)?;
        values.push((MetricKey::Cadence, (payload.get_u16_le() / 2) as f64));
    }

    Ok(values)
}

fn skip(
    payload: &mut &[u8],
    flags: u16,
    bit: u16,
    len: usize,
    characteristic: &'static str,
) -> Result<(), DecodeError> {
    if flags & bit != 0 {
        ensure(payload, len, characteristic)?;
        payload.advance(len);
    }
    Ok(())
}

/// Cadence from CSC Measurement (0x2A5B) crank revolution data.
///
/// Revolutions and event time are cumulative 16-bit counters, the latter
/// in 1/1024 s. The first payload only primes the state.
#[derive(Debug, Default, Clone)]
pub struct CrankCadence {
    last: Option<(u16, u16)>,
}

impl CrankCadence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, mut payload: &[u8]) -> Result<Vec<(MetricKey, f64)>, DecodeError> {
        const NAME: &str = "csc measurement";
        ensure(payload, 1, NAME)?;
        let flags = payload.get_u8();

        if flags & 0x01 != 0 {
            // Wheel revolutions (u32) and wheel event time (u16)
            ensure(payload, 6, NAME)?;
            payload.advance(6);
        }
        if flags & 0x02 == 0 {
            return Ok(Vec::new());
        }

        ensure(payload, 4, NAME)?;
        let revs = payload.get_u16_le();
        let event_time = payload.get_u16_le();

        let Some((last_revs, last_time)) = self.last.replace((revs, event_time)) else {
            return Ok(Vec::new());
        };

        let ticks = event_time.wrapping_sub(last_time);
        if ticks == 0 {
            return Ok(Vec::new());
        }
        let rev_diff = revs.wrapping_sub(last_revs) as f64;
        let cadence = rev_diff * 60.0 / (ticks as f64 / 1024.0);
        Ok(vec![(MetricKey::Cadence, cadence.round_ties_even())])
    }
}
