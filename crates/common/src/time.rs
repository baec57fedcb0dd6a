//! Wall-clock helpers
//!
//! Credential expiry is tracked in unix seconds and project state in unix
//! milliseconds; both readings funnel through here so a clock set before the
//! epoch degrades to zero instead of panicking.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current unix time in seconds.
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
