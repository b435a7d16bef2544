//! Wall-clock helpers.
//!
//! Wire timestamps are seconds, everything internal is **milliseconds since
//! Unix epoch**. Elapsed-time logic (backoff windows) uses
//! `tokio::time::Instant` instead, so it can be driven by paused test time.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

/// Convert a wire timestamp (seconds) to milliseconds.
#[inline]
pub fn secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(1_000)
}

/// Convert milliseconds to a wire timestamp (seconds), truncating.
#[inline]
pub fn ms_to_secs(ms: u64) -> u64 {
    ms / 1_000
}
