use std::time::{SystemTime, UNIX_EPOCH};

pub mod moving_average;

/// Microseconds since the epoch, the timestamp resolution used on the wire
///  for ping round-trip measurement.
pub fn micros_timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_micros() as u64
}
