//! Artifact retention periods.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use artifact_cache_common::{MAX_RETENTION_DAYS, MIN_RETENTION_DAYS};

use crate::error::StorageError;

/// Parse a retention period in days.
///
/// # Errors
/// `Validation` if `value` is not an integer between 1 and 90.
pub fn parse_retention_days(value: &str) -> Result<u32, StorageError> {
    let days: u32 = value.trim().parse().map_err(|_| {
        StorageError::validation(format!(
            "retention days must be an integer between {} and {}, got {:?}",
            MIN_RETENTION_DAYS, MAX_RETENTION_DAYS, value
        ))
    })?;
    validate_retention_days(days)?;
    Ok(days)
}

/// Check that `days` is within the allowed retention range.
pub fn validate_retention_days(days: u32) -> Result<(), StorageError> {
    if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(StorageError::validation(format!(
            "retention days must be between {} and {}, got {}",
            MIN_RETENTION_DAYS, MAX_RETENTION_DAYS, days
        )));
    }
    Ok(())
}

/// Expiry time for something created at `now` and kept for `days`.
pub fn expiry_from(days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    now + ChronoDuration::days(i64::from(days))
}
