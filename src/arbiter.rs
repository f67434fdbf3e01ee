//! First-arrival-of-the-day arbitration.
//!
//! At most one user wins "first to arrive" per group per calendar day, no
//! matter how many devices race for it. The claim is a conditional
//! create-if-absent write against shared storage; atomicity is the store's
//! contract and holds across processes, not just threads.

use chrono::DateTime;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::storage::PresenceStore;

/// Write-once record of who arrived first at a group on a given date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct DailyArrivalClaim {
    pub group_id: String,
    /// UTC calendar date, `YYYY-MM-DD`
    pub claim_date: String,
    pub user_id: String,
    /// Unix timestamp (seconds) of the winning arrival
    pub timestamp: i64,
}

/// Result of a claim attempt. `AlreadyClaimed` is a normal negative
/// outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum ClaimOutcome {
    Won,
    AlreadyClaimed,
}

/// UTC calendar-date key for a unix timestamp.
pub fn claim_date(now: i64) -> String {
    DateTime::from_timestamp(now, 0)
        .map(|dt| dt.date_naive().to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}

/// Arbitrates the daily first-arrival claim through a conditional write.
#[derive(Debug, Clone)]
pub struct FirstArrivalArbiter {
    retry_limit: u32,
}

impl FirstArrivalArbiter {
    pub fn new(retry_limit: u32) -> Self {
        Self { retry_limit }
    }

    /// Attempt to claim first arrival for (group, today-of-`now`).
    ///
    /// Transient storage failures are retried up to the bounded limit, then
    /// surfaced as `AlreadyClaimed` rather than retried indefinitely; a
    /// missed claim is a better failure mode than a blocked check-in.
    pub fn claim(
        &self,
        store: &dyn PresenceStore,
        group_id: &str,
        user_id: &str,
        now: i64,
    ) -> ClaimOutcome {
        let claim = DailyArrivalClaim {
            group_id: group_id.to_string(),
            claim_date: claim_date(now),
            user_id: user_id.to_string(),
            timestamp: now,
        };

        let attempts = self.retry_limit.max(1);
        for attempt in 1..=attempts {
            match store.create_claim_if_absent(&claim) {
                Ok(true) => {
                    debug!(
                        "[FirstArrival] {} won first arrival at {} on {}",
                        user_id, group_id, claim.claim_date
                    );
                    return ClaimOutcome::Won;
                }
                Ok(false) => return ClaimOutcome::AlreadyClaimed,
                Err(err) => {
                    warn!(
                        "[FirstArrival] claim attempt {}/{} for {} failed: {}",
                        attempt, attempts, group_id, err
                    );
                }
            }
        }

        ClaimOutcome::AlreadyClaimed
    }
}

impl Default for FirstArrivalArbiter {
    fn default() -> Self {
        Self::new(3)
    }
}
