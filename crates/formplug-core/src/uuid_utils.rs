//! UUID v7 utilities for time-ordered identifiers.
//!
//! Jobs and execution log rows use UUIDv7 so that primary keys sort by
//! creation time, which keeps recovery scans and log listings in insertion
//! order without a separate sequence.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use formplug_core::uuid_utils::new_v7;
///
/// let id = new_v7();
/// assert_eq!(id.get_version_num(), 7);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Short, human-friendly suffix for labels.
///
/// Takes the trailing 8 hex digits. For UUIDv7 the leading digits encode the
/// timestamp and would collide between ids generated in the same millisecond.
pub fn short_id(uuid: &Uuid) -> String {
    let simple = uuid.simple().to_string();
    simple[simple.len() - 8..].to_string()
}

/// Extract the embedded timestamp from a UUIDv7.
///
/// Returns `None` for other UUID versions.
pub fn extract_timestamp(uuid: &Uuid) -> Option<DateTime<Utc>> {
    if uuid.get_version_num() != 7 {
        return None;
    }
    let bytes = uuid.as_bytes();
    let millis = bytes[..6]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Utc.timestamp_millis_opt(millis as i64).single()
}
