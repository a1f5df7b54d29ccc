//! GPS time and calendar conversions.
//!
//! GPS time is the canonical timestamp inside the engine: whole seconds
//! since 1980-01-06T00:00:00Z. Index files carry ISO-8601 UTC strings;
//! day-of-year filtering works on the group's calendar date.

use chrono::{DateTime, Datelike, TimeZone, Utc};

/// Unix timestamp of the GPS epoch (1980-01-06T00:00:00Z).
pub const GPS_EPOCH_UNIX: i64 = 315_964_800;

/// Convert a UTC datetime to GPS seconds.
pub fn gps_from_datetime(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp() - GPS_EPOCH_UNIX
}

/// Convert GPS seconds back to a UTC datetime.
pub fn datetime_from_gps(gps: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(gps + GPS_EPOCH_UNIX, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Parse an ISO-8601 UTC string (`YYYY-MM-DDTHH:MM:SS.sssZ`).
///
/// Returns `None` when the string is not a well-formed timestamp; callers
/// treat that as "feature carries no date".
pub fn parse_iso8601(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Arithmetic mean of two datetimes, used as the group time for features
/// that carry a `start_datetime`/`end_datetime` pair.
pub fn mean_datetime(a: &DateTime<Utc>, b: &DateTime<Utc>) -> DateTime<Utc> {
    let mid = (a.timestamp() + b.timestamp()) / 2;
    Utc.timestamp_opt(mid, 0).single().unwrap_or(*a)
}

/// Day of year (1-based) of a datetime.
pub fn day_of_year(dt: &DateTime<Utc>) -> u32 {
    dt.ordinal()
}

/// Test whether a day of year falls in `[start, end]`.
///
/// A range with `start > end` wraps across the year boundary, e.g.
/// `[330, 40]` covers late November through early February.
pub fn doy_in_range(doy: u32, start: u32, end: u32) -> bool {
    if start <= end {
        doy >= start && doy <= end
    } else {
        doy >= start || doy <= end
    }
}
