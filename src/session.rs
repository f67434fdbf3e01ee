//! # Presence Session
//!
//! Stateful coordination object owning everything tied to one sign-in: the
//! group registry, the geofence scheduler, the keyed presence machines, the
//! reconciler, the arbiter and the pending-write queue.
//!
//! ## Architecture
//!
//! A session is explicitly constructed at sign-in and consumed by
//! [`PresenceSession::sign_out`]; there is no ambient global state in the
//! core. All transitions flow through `&mut self`, so a manual action and a
//! concurrently arriving region signal are applied one at a time, in arrival
//! order, per (user, group) key. State changes fan out through the explicit
//! observer interface rather than implicit binding.
//!
//! Deadline and staleness checks are evaluated lazily whenever a record is
//! touched (resume, tick, read). The host process may be suspended
//! indefinitely; an absolute stored deadline compared against wall-clock
//! time still produces the correct result on the next evaluation, merely
//! later than nominal.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use rstar::{Envelope, PointDistance, RTree, RTreeObject, AABB};

use crate::arbiter::{ClaimOutcome, FirstArrivalArbiter};
use crate::error::{OptionExt, PresenceError, Result};
use crate::events::{
    AchievementSink, AnalyticsSink, CheckInNotice, SessionEvent, SessionObserver,
};
use crate::reconciler::{PresenceSyncReconciler, PresenceSummary};
use crate::scheduler::{
    GeofenceScheduler, LocationPermission, ReconcileOutcome, RegionEvent, RegionMonitor,
};
use crate::state_machine::{PresenceMachine, PresenceSignal, SignalOutcome, TransitionEffect};
use crate::storage::PresenceStore;
use crate::{AutoCheckoutDuration, EngineConfig, GeoPoint, Group, PresenceRecord};

/// Boundary bounding box stored in the session's spatial index.
#[derive(Debug, Clone)]
struct GroupEnvelope {
    group_id: String,
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
}

impl RTreeObject for GroupEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

impl PointDistance for GroupEnvelope {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        self.envelope().distance_2(point)
    }

    fn contains_point(&self, point: &[f64; 2]) -> bool {
        self.envelope().contains_point(point)
    }
}

/// Session statistics for monitoring.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct SessionStats {
    pub group_count: u32,
    pub machine_count: u32,
    pub registered_region_count: u32,
    pub pending_write_count: u32,
    /// True when region monitoring is unavailable and the session runs
    /// manual-only
    pub degraded: bool,
}

/// All presence state for one signed-in user.
pub struct PresenceSession {
    user_id: String,
    display_name: String,
    config: EngineConfig,

    groups: HashMap<String, Group>,
    scheduler: GeofenceScheduler,
    /// One machine per group; with the session's user fixed, each entry is
    /// the state for one (user, group) key
    machines: HashMap<String, PresenceMachine>,
    reconciler: PresenceSyncReconciler,
    arbiter: FirstArrivalArbiter,
    store: Arc<dyn PresenceStore>,

    analytics: Option<Box<dyn AnalyticsSink>>,
    achievements: Option<Box<dyn AchievementSink>>,
    observers: Vec<Box<dyn SessionObserver>>,

    permission: LocationPermission,
    /// Records whose storage write keeps failing; retried on tick
    pending_writes: Vec<PresenceRecord>,
    spatial_index: RTree<GroupEnvelope>,
    degraded: bool,
}

impl PresenceSession {
    /// Create a session for a signed-in user.
    pub fn new(
        user_id: &str,
        display_name: &str,
        store: Arc<dyn PresenceStore>,
        monitor: Box<dyn RegionMonitor>,
        config: EngineConfig,
    ) -> Self {
        info!("[PresenceSession] session started for {}", user_id);
        let scheduler = GeofenceScheduler::new(monitor, &config);
        let arbiter = FirstArrivalArbiter::new(config.claim_retry_limit);

        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            config,
            groups: HashMap::new(),
            scheduler,
            machines: HashMap::new(),
            reconciler: PresenceSyncReconciler::new(),
            arbiter,
            store,
            analytics: None,
            achievements: None,
            observers: Vec::new(),
            permission: LocationPermission::None,
            pending_writes: Vec::new(),
            spatial_index: RTree::new(),
            degraded: false,
        }
    }

    /// Attach an analytics sink.
    pub fn with_analytics(mut self, sink: Box<dyn AnalyticsSink>) -> Self {
        self.analytics = Some(sink);
        self
    }

    /// Attach an achievement sink.
    pub fn with_achievements(mut self, sink: Box<dyn AchievementSink>) -> Self {
        self.achievements = Some(sink);
        self
    }

    /// Subscribe to session state changes.
    pub fn subscribe(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    // ========================================================================
    // Group Registry
    // ========================================================================

    /// Replace the session's group registry.
    ///
    /// Machines for groups that no longer exist are dropped, cancelling
    /// their deadlines.
    pub fn set_groups(&mut self, groups: Vec<Group>) {
        self.groups = groups
            .into_iter()
            .map(|g| (g.group_id.clone(), g))
            .collect();
        self.machines
            .retain(|group_id, _| self.groups.contains_key(group_id));
        self.rebuild_spatial_index();
    }

    /// Look up a group.
    pub fn group(&self, group_id: &str) -> Option<&Group> {
        self.groups.get(group_id)
    }

    fn rebuild_spatial_index(&mut self) {
        let envelopes: Vec<GroupEnvelope> = self
            .groups
            .values()
            .filter_map(|g| {
                g.bounds().map(|b| GroupEnvelope {
                    group_id: g.group_id.clone(),
                    min_lat: b.min_lat,
                    max_lat: b.max_lat,
                    min_lng: b.min_lng,
                    max_lng: b.max_lng,
                })
            })
            .collect();
        self.spatial_index = RTree::bulk_load(envelopes);
    }

    /// Groups whose boundary contains the point: bounding-box candidates
    /// from the spatial index, refined with the exact containment test.
    pub fn groups_at_location(&self, point: &GeoPoint) -> Vec<&Group> {
        self.spatial_index
            .locate_all_at_point(&[point.longitude, point.latitude])
            .filter_map(|envelope| self.groups.get(&envelope.group_id))
            .filter(|group| group.contains(point))
            .collect()
    }

    // ========================================================================
    // Location & Permission
    // ========================================================================

    /// Update the current location permission level.
    pub fn set_permission(&mut self, permission: LocationPermission) {
        self.permission = permission;
    }

    pub fn permission(&self) -> LocationPermission {
        self.permission
    }

    /// Reconcile the monitored-region set against the current location.
    ///
    /// An unavailable capability is not fatal: the session degrades to
    /// manual-only presence and reports an empty outcome.
    pub fn update_location(&mut self, location: &GeoPoint) -> Result<ReconcileOutcome> {
        let groups: Vec<Group> = self.groups.values().cloned().collect();
        match self.scheduler.reconcile(&groups, location) {
            Ok(outcome) => {
                self.degraded = false;
                if !outcome.is_noop() {
                    self.notify(&SessionEvent::GeofencesReconciled {
                        registered: outcome.registered.clone(),
                        unregistered: outcome.unregistered.clone(),
                    });
                }
                Ok(outcome)
            }
            Err(PresenceError::GeofencingUnavailable { reason }) => {
                if !self.degraded {
                    warn!(
                        "[PresenceSession] geofencing unavailable ({}); manual-only mode",
                        reason
                    );
                    self.notify(&SessionEvent::GeofencingDegraded {
                        reason: reason.clone(),
                    });
                }
                self.degraded = true;
                Ok(ReconcileOutcome::default())
            }
            Err(err) => Err(err),
        }
    }

    /// Whether the session is running without region monitoring.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    // ========================================================================
    // Presence Transitions
    // ========================================================================

    /// Manual check-in with the configured default duration.
    pub fn check_in(&mut self, group_id: &str) -> Result<ClaimOutcome> {
        self.check_in_with(group_id, self.config.default_checkout)
    }

    /// Manual check-in with an explicit auto-checkout duration.
    pub fn check_in_with(
        &mut self,
        group_id: &str,
        duration: AutoCheckoutDuration,
    ) -> Result<ClaimOutcome> {
        self.check_in_at(group_id, duration, Utc::now().timestamp())
    }

    /// Manual check-in at an explicit time (resume/testing hook).
    pub fn check_in_at(
        &mut self,
        group_id: &str,
        duration: AutoCheckoutDuration,
        now: i64,
    ) -> Result<ClaimOutcome> {
        self.groups.get(group_id).ok_or_group_not_found(group_id)?;
        // Settle an expired deadline before stacking a fresh check-in on it
        self.evaluate_deadline_at(group_id, now);

        let outcome = self.apply_signal(group_id, PresenceSignal::ManualCheckIn { duration }, now);
        match outcome {
            SignalOutcome::Applied(effect) => {
                let claim = self.commit_effect(effect, now);
                Ok(claim.unwrap_or(ClaimOutcome::AlreadyClaimed))
            }
            SignalOutcome::Ignored(reason) => {
                debug!("[PresenceSession] check-in ignored: {:?}", reason);
                Ok(ClaimOutcome::AlreadyClaimed)
            }
        }
    }

    /// Manual check-out.
    pub fn check_out(&mut self, group_id: &str) -> Result<()> {
        self.check_out_at(group_id, Utc::now().timestamp())
    }

    /// Manual check-out at an explicit time.
    pub fn check_out_at(&mut self, group_id: &str, now: i64) -> Result<()> {
        self.groups.get(group_id).ok_or_group_not_found(group_id)?;
        self.evaluate_deadline_at(group_id, now);

        let outcome = self.apply_signal(group_id, PresenceSignal::ManualCheckOut, now);
        match outcome {
            SignalOutcome::Applied(effect) => {
                self.commit_effect(effect, now);
            }
            SignalOutcome::Ignored(reason) => {
                debug!("[PresenceSession] check-out ignored: {:?}", reason);
            }
        }
        Ok(())
    }

    /// Route a region-crossing domain event to its machine.
    pub fn handle_region_event(&mut self, event: RegionEvent) -> Result<()> {
        self.handle_region_event_at(event, Utc::now().timestamp())
    }

    /// Route a region-crossing domain event at an explicit time.
    pub fn handle_region_event_at(&mut self, event: RegionEvent, now: i64) -> Result<()> {
        let group_id = event.group_id().to_string();
        if !self.groups.contains_key(&group_id) {
            debug!(
                "[PresenceSession] region event for unknown group {} dropped",
                group_id
            );
            return Ok(());
        }
        self.evaluate_deadline_at(&group_id, now);

        let signal = match event {
            RegionEvent::Entered { .. } => PresenceSignal::RegionEntered,
            RegionEvent::Exited { .. } => PresenceSignal::RegionExited,
        };

        match self.apply_signal(&group_id, signal, now) {
            SignalOutcome::Applied(effect) => {
                self.commit_effect(effect, now);
            }
            SignalOutcome::Ignored(reason) => {
                debug!(
                    "[PresenceSession] region event for {} ignored: {:?}",
                    group_id, reason
                );
            }
        }
        Ok(())
    }

    /// Periodic/resume hook: evaluate every pending deadline and retry
    /// queued writes. Never blocks on a timer.
    pub fn tick(&mut self) {
        self.tick_at(Utc::now().timestamp());
    }

    /// Periodic/resume hook at an explicit time.
    pub fn tick_at(&mut self, now: i64) {
        let group_ids: Vec<String> = self.machines.keys().cloned().collect();
        for group_id in group_ids {
            self.evaluate_deadline_at(&group_id, now);
        }
        self.flush_pending_writes();
    }

    fn evaluate_deadline_at(&mut self, group_id: &str, now: i64) {
        let outcome = match self.machines.get_mut(group_id) {
            Some(machine) => machine.apply(PresenceSignal::DeadlineCheck, self.permission, now),
            None => return,
        };
        if let SignalOutcome::Applied(effect) = outcome {
            info!(
                "[PresenceSession] auto-checkout for {} at {}",
                group_id, now
            );
            self.commit_effect(effect, now);
        }
    }

    fn apply_signal(
        &mut self,
        group_id: &str,
        signal: PresenceSignal,
        now: i64,
    ) -> SignalOutcome {
        let user_id = self.user_id.clone();
        let display_name = self.display_name.clone();
        let throttle = self.config.throttle_window_secs;
        let machine = self.machines.entry(group_id.to_string()).or_insert_with(|| {
            PresenceMachine::new(&user_id, group_id, &display_name).with_throttle_window(throttle)
        });
        machine.apply(signal, self.permission, now)
    }

    /// Apply an effect: persist the record, arbitrate first arrival, notify
    /// sinks and observers.
    fn commit_effect(&mut self, effect: TransitionEffect, now: i64) -> Option<ClaimOutcome> {
        self.write_record(&effect.record);

        let claim = if effect.claim_first_arrival {
            let outcome = self.arbiter.claim(
                self.store.as_ref(),
                &effect.record.group_id,
                &self.user_id,
                now,
            );
            if let Some(sink) = &self.achievements {
                sink.on_check_in(&CheckInNotice {
                    user_id: self.user_id.clone(),
                    group_id: effect.record.group_id.clone(),
                    timestamp: now,
                    won_first_arrival: outcome == ClaimOutcome::Won,
                });
            }
            Some(outcome)
        } else {
            None
        };

        if let (Some(sink), Some(event)) = (&self.analytics, &effect.analytics) {
            sink.record(event);
        }

        self.notify(&SessionEvent::PresenceChanged {
            record: effect.record,
        });

        claim
    }

    // ========================================================================
    // Storage Writes
    // ========================================================================

    /// Upsert with bounded stepped-backoff retries. A record that still
    /// cannot be written is queued and retried on the next tick; the
    /// machine's optimistic copy is kept either way.
    fn write_record(&mut self, record: &PresenceRecord) {
        let mut attempt: u32 = 0;
        loop {
            match self.store.upsert_presence(record) {
                Ok(()) => return,
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.config.write_retry_limit.max(1) {
                        warn!(
                            "[PresenceSession] write for {} failed after {} attempts: {}; queued",
                            record.group_id, attempt, err
                        );
                        self.queue_pending(record.clone());
                        return;
                    }
                    thread::sleep(Duration::from_millis(
                        self.config.write_backoff_step_ms * attempt as u64,
                    ));
                }
            }
        }
    }

    fn queue_pending(&mut self, record: PresenceRecord) {
        // A newer write for the same key supersedes the queued one
        self.pending_writes
            .retain(|r| !(r.user_id == record.user_id && r.group_id == record.group_id));
        self.pending_writes.push(record);
    }

    fn flush_pending_writes(&mut self) {
        if self.pending_writes.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_writes);
        for record in pending {
            if let Err(err) = self.store.upsert_presence(&record) {
                debug!(
                    "[PresenceSession] queued write for {} still failing: {}",
                    record.group_id, err
                );
                self.pending_writes.push(record);
            }
        }
    }

    // ========================================================================
    // Summaries & Sync
    // ========================================================================

    /// Feed a fresh authoritative snapshot from the remote stream.
    pub fn apply_remote_snapshot(&mut self, group_id: &str, records: Vec<PresenceRecord>) {
        self.reconciler.apply_snapshot(group_id, records);
    }

    /// Pull the stored snapshot for a group into the reconciler (for hosts
    /// without a push stream).
    pub fn refresh_snapshot(&mut self, group_id: &str) -> Result<()> {
        let records = self.store.presence_snapshot(group_id)?;
        self.reconciler.apply_snapshot(group_id, records);
        Ok(())
    }

    /// Display summary for a group, merging this device's optimistic state
    /// with the latest remote snapshot and filtering stale records.
    pub fn summary(&mut self, group_id: &str) -> PresenceSummary {
        self.summary_at(group_id, Utc::now().timestamp())
    }

    /// Display summary at an explicit time.
    pub fn summary_at(&mut self, group_id: &str, now: i64) -> PresenceSummary {
        // Reads count as a deadline evaluation
        self.evaluate_deadline_at(group_id, now);

        let local: Vec<PresenceRecord> = self
            .machines
            .values()
            .filter_map(|m| m.local_record())
            .collect();
        self.reconciler.summary(group_id, &local, now)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Session statistics.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            group_count: self.groups.len() as u32,
            machine_count: self.machines.len() as u32,
            registered_region_count: self.scheduler.registration_count() as u32,
            pending_write_count: self.pending_writes.len() as u32,
            degraded: self.degraded,
        }
    }

    /// Tear the session down: every geofence registration is cleared and all
    /// machines (with their pending deadlines) are dropped before a new
    /// session can begin.
    pub fn sign_out(mut self) {
        info!("[PresenceSession] session ending for {}", self.user_id);
        self.scheduler.clear();
        for machine in self.machines.values_mut() {
            machine.cancel_deadline();
        }
        self.machines.clear();
        self.pending_writes.clear();
        self.observers.clear();
    }

    fn notify(&self, event: &SessionEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AnalyticsEvent;
    use crate::scheduler::MemoryRegionMonitor;
    use crate::storage::MemoryPresenceStore;
    use crate::DisplayMode;
    use std::sync::Mutex;

    fn group_at(id: &str, lat: f64, lon: f64) -> Group {
        let side = 0.0004;
        Group::new(
            id,
            id,
            vec![
                GeoPoint::new(lat, lon),
                GeoPoint::new(lat, lon + side),
                GeoPoint::new(lat + side, lon + side),
                GeoPoint::new(lat + side, lon),
            ],
            DisplayMode::Names,
        )
        .unwrap()
    }

    fn session() -> (PresenceSession, Arc<MemoryPresenceStore>, MemoryRegionMonitor) {
        let store = Arc::new(MemoryPresenceStore::new());
        let monitor = MemoryRegionMonitor::new();
        let mut session = PresenceSession::new(
            "u1",
            "Alice",
            store.clone(),
            Box::new(monitor.clone()),
            EngineConfig::default(),
        );
        session.set_groups(vec![group_at("g1", 0.0, 0.0), group_at("g2", 0.01, 0.0)]);
        (session, store, monitor)
    }

    /// Analytics sink sharing its event log with the test.
    #[derive(Clone, Default)]
    struct RecordingAnalytics {
        events: Arc<Mutex<Vec<AnalyticsEvent>>>,
    }

    impl AnalyticsSink for RecordingAnalytics {
        fn record(&self, event: &AnalyticsEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[derive(Clone, Default)]
    struct RecordingAchievements {
        notices: Arc<Mutex<Vec<CheckInNotice>>>,
    }

    impl AchievementSink for RecordingAchievements {
        fn on_check_in(&self, notice: &CheckInNotice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    #[test]
    fn test_check_in_persists_and_claims() {
        let (session, store, _) = session();
        let achievements = RecordingAchievements::default();
        let mut session = session.with_achievements(Box::new(achievements.clone()));

        let outcome = session
            .check_in_at("g1", AutoCheckoutDuration::Min60, 1_700_000_000)
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::Won);

        let record = store.record("u1", "g1").unwrap();
        assert!(record.is_present);
        assert!(record.is_manual);

        let notices = achievements.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].won_first_arrival);
    }

    #[test]
    fn test_check_in_unknown_group() {
        let (mut session, _, _) = session();
        let result = session.check_in_at("nope", AutoCheckoutDuration::Min60, 0);
        assert!(matches!(result, Err(PresenceError::GroupNotFound { .. })));
    }

    #[test]
    fn test_region_events_respect_manual_override() {
        let (mut session, store, _) = session();
        session.set_permission(LocationPermission::Continuous);

        session
            .check_in_at("g1", AutoCheckoutDuration::Min60, 1000)
            .unwrap();
        session
            .handle_region_event_at(
                RegionEvent::Exited {
                    group_id: "g1".to_string(),
                },
                2000,
            )
            .unwrap();

        // Still present: the manual override won
        assert!(store.record("u1", "g1").unwrap().is_present);
    }

    #[test]
    fn test_throttled_region_events_write_once() {
        let (mut session, store, _) = session();
        session.set_permission(LocationPermission::Continuous);

        session
            .handle_region_event_at(
                RegionEvent::Entered {
                    group_id: "g1".to_string(),
                },
                1000,
            )
            .unwrap();
        session
            .handle_region_event_at(
                RegionEvent::Exited {
                    group_id: "g1".to_string(),
                },
                1010,
            )
            .unwrap();

        // The exit 10s later was suppressed; the stored record is the entry
        let record = store.record("u1", "g1").unwrap();
        assert!(record.is_present);
        assert_eq!(record.last_updated, 1000);
    }

    #[test]
    fn test_region_entry_needs_continuous_permission() {
        let (mut session, store, _) = session();
        session.set_permission(LocationPermission::ForegroundOnly);

        session
            .handle_region_event_at(
                RegionEvent::Entered {
                    group_id: "g1".to_string(),
                },
                1000,
            )
            .unwrap();

        assert!(store.record("u1", "g1").is_none());
    }

    #[test]
    fn test_unknown_region_event_dropped() {
        let (mut session, store, _) = session();
        session.set_permission(LocationPermission::Continuous);

        session
            .handle_region_event_at(
                RegionEvent::Entered {
                    group_id: "ghost".to_string(),
                },
                1000,
            )
            .unwrap();

        assert_eq!(store.record_count(), 0);
        assert_eq!(session.stats().machine_count, 0);
    }

    #[test]
    fn test_tick_applies_deadline() {
        let (session, store, _) = session();
        let analytics = RecordingAnalytics::default();
        let mut session = session.with_analytics(Box::new(analytics.clone()));

        session
            .check_in_at("g1", AutoCheckoutDuration::Min15, 0)
            .unwrap();
        session.tick_at(10 * 60);
        assert!(store.record("u1", "g1").unwrap().is_present);

        session.tick_at(16 * 60);
        assert!(!store.record("u1", "g1").unwrap().is_present);

        let events = analytics.events.lock().unwrap();
        assert!(events.contains(&AnalyticsEvent::AutoCheckOut {
            group_id: "g1".to_string(),
            duration_minutes: 15,
        }));
    }

    #[test]
    fn test_summary_read_settles_deadline() {
        let (mut session, _, _) = session();
        session
            .check_in_at("g1", AutoCheckoutDuration::Min15, 0)
            .unwrap();

        // Reading the summary past the deadline flips the record
        let summary = session.summary_at("g1", 16 * 60);
        assert_eq!(summary.present_count, 0);
    }

    #[test]
    fn test_summary_merges_remote_snapshot() {
        let (mut session, _, _) = session();
        session
            .check_in_at("g1", AutoCheckoutDuration::Min60, 1000)
            .unwrap();

        session.apply_remote_snapshot(
            "g1",
            vec![PresenceRecord {
                user_id: "u2".to_string(),
                group_id: "g1".to_string(),
                is_present: true,
                is_manual: false,
                last_updated: 1000,
                display_name: "Bob".to_string(),
            }],
        );

        let summary = session.summary_at("g1", 1100);
        assert_eq!(summary.present_count, 2);
        assert_eq!(
            summary.present_members,
            vec!["Alice".to_string(), "Bob".to_string()]
        );
    }

    #[test]
    fn test_failed_writes_queue_and_flush() {
        let store = Arc::new(MemoryPresenceStore::new());
        let mut config = EngineConfig::default();
        config.write_backoff_step_ms = 1;
        let mut session = PresenceSession::new(
            "u1",
            "Alice",
            store.clone(),
            Box::new(MemoryRegionMonitor::new()),
            config,
        );
        session.set_groups(vec![group_at("g1", 0.0, 0.0)]);

        // All three attempts fail; the record lands in the pending queue
        store.inject_write_failures(3);
        session
            .check_in_at("g1", AutoCheckoutDuration::Min60, 1000)
            .unwrap();
        assert_eq!(session.stats().pending_write_count, 1);
        assert!(store.record("u1", "g1").is_none());

        // Next tick flushes it
        session.tick_at(1060);
        assert_eq!(session.stats().pending_write_count, 0);
        assert!(store.record("u1", "g1").unwrap().is_present);
    }

    #[test]
    fn test_degraded_mode_on_unavailable_monitor() {
        let store = Arc::new(MemoryPresenceStore::new());
        let monitor = MemoryRegionMonitor::unavailable();
        let mut session = PresenceSession::new(
            "u1",
            "Alice",
            store,
            Box::new(monitor),
            EngineConfig::default(),
        );
        session.set_groups(vec![group_at("g1", 0.0, 0.0)]);

        let outcome = session.update_location(&GeoPoint::new(0.0, 0.0)).unwrap();
        assert!(outcome.is_noop());
        assert!(session.is_degraded());

        // Manual presence still works
        session
            .check_in_at("g1", AutoCheckoutDuration::Min60, 1000)
            .unwrap();
        assert_eq!(session.summary_at("g1", 1100).present_count, 1);
    }

    #[test]
    fn test_sign_out_clears_registrations() {
        let (mut session, _, monitor) = session();
        session.update_location(&GeoPoint::new(0.0, 0.0)).unwrap();
        assert_eq!(monitor.registered_count(), 2);

        session.sign_out();
        assert_eq!(monitor.registered_count(), 0);
    }

    #[test]
    fn test_groups_at_location() {
        let (mut session, _, _) = session();

        let inside_g1 = GeoPoint::new(0.0002, 0.0002);
        let found = session.groups_at_location(&inside_g1);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].group_id, "g1");

        let nowhere = GeoPoint::new(-5.0, -5.0);
        assert!(session.groups_at_location(&nowhere).is_empty());

        // Removing the group empties the index
        session.set_groups(vec![]);
        assert!(session.groups_at_location(&inside_g1).is_empty());
    }

    #[test]
    fn test_checked_out_then_region_entry_goes_auto() {
        let (mut session, store, _) = session();
        session.set_permission(LocationPermission::Continuous);

        session
            .check_in_at("g1", AutoCheckoutDuration::Min60, 1000)
            .unwrap();
        session.check_out_at("g1", 1100).unwrap();

        session
            .handle_region_event_at(
                RegionEvent::Entered {
                    group_id: "g1".to_string(),
                },
                1131,
            )
            .unwrap();

        let record = store.record("u1", "g1").unwrap();
        assert!(record.is_present);
        assert!(!record.is_manual);
    }
}
