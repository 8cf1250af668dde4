//! Utility functions for Nexus

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter
///
/// The ceiling doubles per attempt starting at `base` and is capped at `max`;
/// the returned delay is drawn uniformly from the upper half of that ceiling.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use nexus_common::backoff_delay;
///
/// let delay = backoff_delay(3, Duration::from_millis(10), Duration::from_millis(200));
/// assert!(delay >= Duration::from_millis(40));
/// assert!(delay <= Duration::from_millis(80));
/// ```
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    let ceiling = base.saturating_mul(factor).min(max);
    let ceiling_ms = ceiling.as_millis() as u64;
    if ceiling_ms < 2 {
        return ceiling;
    }
    let floor_ms = ceiling_ms / 2;
    Duration::from_millis(rand::rng().random_range(floor_ms..=ceiling_ms))
}

/// Normalize a `host:port` address given on the command line or in config
pub fn normalize_address(address: &str) -> String {
    address.trim().trim_end_matches('/').to_lowercase()
}
