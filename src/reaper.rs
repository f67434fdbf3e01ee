//! Stale-presence classification.
//!
//! A presence record older than the maximum presence duration is treated as
//! absent wherever presence is read for display or aggregation. Records are
//! never deleted here; retention is the storage layer's policy.

use crate::PresenceRecord;

/// Maximum age of a presence record before it is treated as absent: 10 hours.
pub const MAX_PRESENCE_SECS: i64 = 10 * 60 * 60;

/// Whether a record has outlived the maximum presence duration.
///
/// Strictly greater-than: a record exactly at the limit is not stale.
pub fn is_stale(record: &PresenceRecord, now: i64) -> bool {
    now - record.last_updated > MAX_PRESENCE_SECS
}

/// Presence as it should be displayed: present and not stale.
pub fn effective_presence(record: &PresenceRecord, now: i64) -> bool {
    record.is_present && !is_stale(record, now)
}

/// Filter a record set down to effectively-present entries.
pub fn filter_present<'a>(records: &'a [PresenceRecord], now: i64) -> Vec<&'a PresenceRecord> {
    records
        .iter()
        .filter(|r| effective_presence(r, now))
        .collect()
}
