//! Presence storage contract and the in-memory reference implementation.
//!
//! The engine never talks to a concrete database directly: it writes and
//! reads through [`PresenceStore`]. The conditional claim write is the
//! store's atomicity contract: implementations must guarantee that exactly
//! one concurrent caller observes creation, even across processes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::arbiter::DailyArrivalClaim;
use crate::error::{PresenceError, Result};
use crate::PresenceRecord;

/// Storage contract consumed by the engine.
pub trait PresenceStore: Send + Sync {
    /// Insert or replace the record for (user, group).
    ///
    /// Transient failures are reported as [`PresenceError::StorageWrite`];
    /// callers retry with backoff and keep their optimistic copy until the
    /// write lands.
    fn upsert_presence(&self, record: &PresenceRecord) -> Result<()>;

    /// All presence records currently stored for a group.
    fn presence_snapshot(&self, group_id: &str) -> Result<Vec<PresenceRecord>>;

    /// Create the claim if no claim exists for its (group, date) key.
    ///
    /// Returns `Ok(true)` if this call created the claim, `Ok(false)` if a
    /// claim already existed. Must be atomic across concurrent callers.
    fn create_claim_if_absent(&self, claim: &DailyArrivalClaim) -> Result<bool>;
}

/// In-memory store for tests and single-process hosts.
///
/// Supports injecting transient write failures to exercise the engine's
/// retry path.
#[derive(Default)]
pub struct MemoryPresenceStore {
    records: Mutex<HashMap<(String, String), PresenceRecord>>,
    claims: Mutex<HashMap<(String, String), DailyArrivalClaim>>,
    failing_writes: AtomicU32,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` upserts fail with a transient storage error.
    pub fn inject_write_failures(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of stored presence records.
    pub fn record_count(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Look up a stored record directly (test helper).
    pub fn record(&self, user_id: &str, group_id: &str) -> Option<PresenceRecord> {
        self.records
            .lock()
            .ok()?
            .get(&(user_id.to_string(), group_id.to_string()))
            .cloned()
    }

    /// Look up a stored claim directly (test helper).
    pub fn claim(&self, group_id: &str, claim_date: &str) -> Option<DailyArrivalClaim> {
        self.claims
            .lock()
            .ok()?
            .get(&(group_id.to_string(), claim_date.to_string()))
            .cloned()
    }

    fn take_injected_failure(&self) -> bool {
        let mut current = self.failing_writes.load(Ordering::SeqCst);
        while current > 0 {
            match self.failing_writes.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}

impl PresenceStore for MemoryPresenceStore {
    fn upsert_presence(&self, record: &PresenceRecord) -> Result<()> {
        if self.take_injected_failure() {
            return Err(PresenceError::StorageWrite {
                message: "injected transient failure".to_string(),
            });
        }

        let mut records = self.records.lock().map_err(|_| PresenceError::StorageWrite {
            message: "record store poisoned".to_string(),
        })?;
        records.insert(
            (record.user_id.clone(), record.group_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn presence_snapshot(&self, group_id: &str) -> Result<Vec<PresenceRecord>> {
        let records = self.records.lock().map_err(|_| PresenceError::StorageWrite {
            message: "record store poisoned".to_string(),
        })?;
        Ok(records
            .values()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect())
    }

    fn create_claim_if_absent(&self, claim: &DailyArrivalClaim) -> Result<bool> {
        let mut claims = self.claims.lock().map_err(|_| PresenceError::StorageWrite {
            message: "claim store poisoned".to_string(),
        })?;

        let key = (claim.group_id.clone(), claim.claim_date.clone());
        if claims.contains_key(&key) {
            return Ok(false);
        }
        claims.insert(key, claim.clone());
        Ok(true)
    }
}
