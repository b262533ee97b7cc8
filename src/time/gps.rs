use chrono::{DateTime, Duration, Utc};

use crate::core::{Error, Result};

/// GPS time runs ahead of UTC by the leap seconds inserted since 1980
pub const GPS_UTC_LEAP_SECONDS: i64 = 18;

/// Unix timestamp of 1980-01-06T00:00:00Z
pub const GPS_EPOCH_UNIX: i64 = 315_964_800;

/// Start of GPS time
pub fn gps_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + Duration::seconds(GPS_EPOCH_UNIX)
}

/// Converts seconds since the GPS epoch to UTC
pub fn gps_to_utc(gps_seconds: u32) -> DateTime<Utc> {
    gps_epoch() + Duration::seconds(gps_seconds as i64 - GPS_UTC_LEAP_SECONDS)
}

/// Converts UTC to seconds since the GPS epoch
pub fn utc_to_gps(utc: DateTime<Utc>) -> Result<u32> {
    let seconds = utc.timestamp() - GPS_EPOCH_UNIX + GPS_UTC_LEAP_SECONDS;
    u32::try_from(seconds)
        .map_err(|_| Error::timing(format!("{} is outside the GPS time range", utc)))
}
