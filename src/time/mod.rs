//! Time handling
//!
//! LoRaWAN application packages exchange time as seconds since the GPS epoch
//! (1980-01-06T00:00:00Z). The MAC layer keeps that clock; this module maps it
//! to and from UTC for the application.

mod gps;

pub use self::gps::{gps_epoch, gps_to_utc, utc_to_gps, GPS_EPOCH_UNIX, GPS_UTC_LEAP_SECONDS};

use std::time::Duration;

/// Adds a signed correction to a GPS timestamp, clamping at the epoch
pub fn apply_correction(gps_seconds: u32, correction: i32) -> u32 {
    let corrected = gps_seconds as i64 + correction as i64;
    corrected.clamp(0, u32::MAX as i64) as u32
}

/// Seconds until `target`, zero if it already passed
pub fn time_until(now_gps: u32, target_gps: u32) -> Duration {
    Duration::from_secs(target_gps.saturating_sub(now_gps) as u64)
}
