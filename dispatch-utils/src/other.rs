//! Module containing some utility functions that didn't fit anywhere else.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use time::{format_description, OffsetDateTime};

/// Formats the given point in time in YYYY-MM-DD HH:mm:SS (local time if available).
pub fn format_local(at: SystemTime) -> String {
    let at = OffsetDateTime::from(at);
    let at = match time::UtcOffset::current_local_offset() {
        Ok(offset) => at.to_offset(offset),
        Err(e) => {
            log::trace!("local offset unavailable, formatting in UTC: {e}");
            at
        }
    };
    let Ok(format) = format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
    else {
        return at.unix_timestamp().to_string();
    };
    at.format(&format)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Seconds since the unix epoch, as used in artifact and backup file names.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
