//! Instant / epoch-double conversions.
//!
//! The schema stores `expire`, `last_update`, and `last_use` as REAL
//! seconds since the Unix epoch. Conversions are nanosecond-truncated on
//! the way out and nanosecond-lifted on the way back; round-tripping an
//! instant stays within one microsecond of identity for any instant whose
//! nanosecond count fits a 64-bit integer.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Converts an absolute instant to seconds since the Unix epoch.
///
/// Instants before the epoch map to negative values.
pub fn instant_to_epoch(instant: SystemTime) -> f64 {
    match instant.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_nanos() as f64 / 1e9,
        Err(before) => -(before.duration().as_nanos() as f64) / 1e9,
    }
}

/// Converts seconds since the Unix epoch back to an absolute instant.
pub fn epoch_to_instant(epoch: f64) -> SystemTime {
    let nanos = (epoch * 1e9) as i64;
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}
