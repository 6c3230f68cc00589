//! Shared payload types and utilities used across all switchboard crates.

pub mod types;

/// Seconds since the Unix epoch, saturating to zero on clock skew.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
