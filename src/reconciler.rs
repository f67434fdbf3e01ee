//! Reconciliation of local optimistic presence with the remote snapshot.
//!
//! Every device holds optimistic records for its own transitions while the
//! authoritative copies live in shared storage. The reconciler merges the
//! two views with last-writer-wins on `last_updated` (the remote value is
//! preferred once acknowledged, so all devices converge on one truth) and
//! produces the human-facing summary. Only boolean presence ever leaves this
//! module; other members' raw coordinates are never part of the model.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::reaper;
use crate::{DisplayMode, PresenceRecord};

/// Display-ready presence roll-up for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct PresenceSummary {
    pub group_id: String,
    pub present_count: u32,
    /// Display names of effectively-present members, sorted
    pub present_members: Vec<String>,
}

/// Merge local optimistic records with the remote snapshot.
///
/// One record survives per user: the newer of the two by `last_updated`,
/// with the remote copy winning ties.
pub fn merge_records(
    local: &[PresenceRecord],
    remote: &[PresenceRecord],
) -> Vec<PresenceRecord> {
    let mut merged: HashMap<&str, &PresenceRecord> = HashMap::new();

    for record in remote {
        merged.insert(record.user_id.as_str(), record);
    }
    for record in local {
        match merged.get(record.user_id.as_str()) {
            Some(existing) if existing.last_updated >= record.last_updated => {}
            _ => {
                merged.insert(record.user_id.as_str(), record);
            }
        }
    }

    let mut records: Vec<PresenceRecord> = merged.into_values().cloned().collect();
    records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    records
}

/// Holds the latest authoritative snapshot per group and produces summaries.
#[derive(Debug, Default)]
pub struct PresenceSyncReconciler {
    snapshots: HashMap<String, Vec<PresenceRecord>>,
}

impl PresenceSyncReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored snapshot for a group with a fresh one from the
    /// authoritative stream.
    pub fn apply_snapshot(&mut self, group_id: &str, records: Vec<PresenceRecord>) {
        debug!(
            "[PresenceSync] snapshot for {}: {} records",
            group_id,
            records.len()
        );
        self.snapshots.insert(group_id.to_string(), records);
    }

    /// The last snapshot seen for a group.
    pub fn snapshot(&self, group_id: &str) -> &[PresenceRecord] {
        self.snapshots
            .get(group_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Merge local and remote views and roll up who is effectively present.
    ///
    /// Stale records are treated as absent before counting.
    pub fn summary(
        &self,
        group_id: &str,
        local: &[PresenceRecord],
        now: i64,
    ) -> PresenceSummary {
        let local_for_group: Vec<PresenceRecord> = local
            .iter()
            .filter(|r| r.group_id == group_id)
            .cloned()
            .collect();

        let merged = merge_records(&local_for_group, self.snapshot(group_id));
        let mut present_members: Vec<String> = reaper::filter_present(&merged, now)
            .into_iter()
            .map(|r| r.display_name.clone())
            .collect();
        present_members.sort();

        PresenceSummary {
            group_id: group_id.to_string(),
            present_count: present_members.len() as u32,
            present_members,
        }
    }
}

/// Render a summary for display. Pure function of the summary and the
/// group's display mode.
pub fn format_summary(summary: &PresenceSummary, mode: DisplayMode) -> String {
    if summary.present_count == 0 {
        return "No one here".to_string();
    }

    match mode {
        DisplayMode::Count => {
            if summary.present_count == 1 {
                "1 person here".to_string()
            } else {
                format!("{} people here", summary.present_count)
            }
        }
        DisplayMode::Names => summary.present_members.join(", "),
    }
}
