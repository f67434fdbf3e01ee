//! Monitored-region scheduling under the platform geofence ceiling.
//!
//! Platforms cap how many regions a device may watch at once. The scheduler
//! keeps the registered set within that ceiling while covering the groups
//! closest to the device, and normalizes raw region-crossing callbacks into
//! domain events without interpreting them.
//!
//! Register/unregister calls into the platform capability are fire-and-forget
//! and idempotent: after a crash or restart they may be issued redundantly
//! and the platform must tolerate that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PresenceError, Result};
use crate::geo_utils::haversine_distance;
use crate::geometry;
use crate::{EngineConfig, GeoPoint, Group};

/// Hard platform ceiling on concurrently monitored regions.
pub const REGION_CEILING: usize = 20;

/// Location permission level reported by the host's location provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum LocationPermission {
    None,
    ForegroundOnly,
    Continuous,
}

/// Platform status of a single registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum RegistrationStatus {
    Active,
    Failed,
}

/// A circular monitored region derived from a group's boundary.
///
/// Ephemeral: recomputed whenever the desired monitored set changes, and
/// owned exclusively by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GeofenceRegistration {
    pub group_id: String,
    pub center: GeoPoint,
    pub radius_m: f64,
    pub status: RegistrationStatus,
}

/// Region crossing normalized into a domain event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionEvent {
    Entered { group_id: String },
    Exited { group_id: String },
}

impl RegionEvent {
    pub fn group_id(&self) -> &str {
        match self {
            RegionEvent::Entered { group_id } | RegionEvent::Exited { group_id } => group_id,
        }
    }
}

/// Platform region-monitoring capability.
///
/// Implementations bridge to CoreLocation, GeofencingClient or an equivalent.
/// Both calls must be idempotent: registering an already-registered region or
/// unregistering an unknown one is a no-op, not an error.
pub trait RegionMonitor: Send {
    /// Whether region monitoring is currently usable (permission granted and
    /// hardware support present).
    fn is_available(&self) -> bool;

    /// Start monitoring a region.
    fn register(&mut self, registration: &GeofenceRegistration) -> Result<()>;

    /// Stop monitoring the region for a group.
    fn unregister(&mut self, group_id: &str) -> Result<()>;
}

/// What a reconcile pass actually changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    /// Group ids newly registered (or re-registered after a geometry change)
    pub registered: Vec<String>,
    /// Group ids dropped from monitoring
    pub unregistered: Vec<String>,
    /// Group ids left untouched
    pub retained: Vec<String>,
}

impl ReconcileOutcome {
    /// True when the pass issued no platform calls.
    pub fn is_noop(&self) -> bool {
        self.registered.is_empty() && self.unregistered.is_empty()
    }
}

/// Keeps the monitored-region set within the ceiling, covering the groups
/// nearest the device.
pub struct GeofenceScheduler {
    monitor: Box<dyn RegionMonitor>,
    registrations: HashMap<String, GeofenceRegistration>,
    region_ceiling: usize,
    min_radius_m: f64,
    max_radius_m: f64,
}

impl GeofenceScheduler {
    pub fn new(monitor: Box<dyn RegionMonitor>, config: &EngineConfig) -> Self {
        Self {
            monitor,
            registrations: HashMap::new(),
            region_ceiling: (config.region_ceiling as usize).min(REGION_CEILING),
            min_radius_m: config.min_region_radius_m,
            max_radius_m: config.max_region_radius_m,
        }
    }

    /// Recompute and apply the desired monitored set for the current
    /// location.
    ///
    /// Groups are ranked by centroid distance (ascending, group-id
    /// tie-break) and the nearest `min(n, ceiling)` are kept monitored.
    /// Idempotent: reconciling twice with identical inputs issues no
    /// platform calls the second time.
    ///
    /// If the capability is unavailable the registered set is cleared and
    /// `GeofencingUnavailable` is reported; callers fall back to manual-only
    /// presence for the session.
    pub fn reconcile(&mut self, groups: &[Group], location: &GeoPoint) -> Result<ReconcileOutcome> {
        if !self.monitor.is_available() {
            self.clear();
            return Err(PresenceError::GeofencingUnavailable {
                reason: "region monitoring unavailable or not permitted".to_string(),
            });
        }

        let mut ranked: Vec<(f64, &Group)> = groups
            .iter()
            .map(|g| (haversine_distance(location, &g.centroid), g))
            .collect();
        ranked.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.group_id.cmp(&b.1.group_id))
        });

        let desired: HashMap<String, GeofenceRegistration> = ranked
            .iter()
            .take(self.region_ceiling)
            .map(|(_, group)| {
                (
                    group.group_id.clone(),
                    GeofenceRegistration {
                        group_id: group.group_id.clone(),
                        center: group.centroid,
                        radius_m: self.region_radius(group),
                        status: RegistrationStatus::Active,
                    },
                )
            })
            .collect();

        let mut outcome = ReconcileOutcome::default();

        // Drop registrations that fell out of the selection
        let dropped: Vec<String> = self
            .registrations
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for group_id in dropped {
            if let Err(err) = self.monitor.unregister(&group_id) {
                warn!("[GeofenceScheduler] unregister {} failed: {}", group_id, err);
            }
            self.registrations.remove(&group_id);
            outcome.unregistered.push(group_id);
        }

        // Register new selections; re-register entries whose geometry moved
        for (group_id, registration) in desired {
            match self.registrations.get(&group_id) {
                Some(existing)
                    if existing.center == registration.center
                        && existing.radius_m == registration.radius_m =>
                {
                    outcome.retained.push(group_id);
                }
                Some(_) => {
                    if let Err(err) = self.monitor.unregister(&group_id) {
                        warn!("[GeofenceScheduler] unregister {} failed: {}", group_id, err);
                    }
                    self.apply_registration(registration, &mut outcome);
                }
                None => {
                    self.apply_registration(registration, &mut outcome);
                }
            }
        }

        if !outcome.is_noop() {
            info!(
                "[GeofenceScheduler] reconciled: {} registered, {} unregistered, {} retained",
                outcome.registered.len(),
                outcome.unregistered.len(),
                outcome.retained.len()
            );
        }

        Ok(outcome)
    }

    fn apply_registration(
        &mut self,
        registration: GeofenceRegistration,
        outcome: &mut ReconcileOutcome,
    ) {
        let group_id = registration.group_id.clone();
        match self.monitor.register(&registration) {
            Ok(()) => {
                self.registrations.insert(group_id.clone(), registration);
                outcome.registered.push(group_id);
            }
            Err(err) => {
                // Left out of the set so the next reconcile retries it
                warn!("[GeofenceScheduler] register {} failed: {}", group_id, err);
            }
        }
    }

    /// Region radius for a group: largest centroid-to-vertex distance,
    /// clamped to the platform's accepted range.
    fn region_radius(&self, group: &Group) -> f64 {
        geometry::max_vertex_distance(&group.centroid, &group.boundary)
            .clamp(self.min_radius_m, self.max_radius_m)
    }

    /// Normalize a raw entry callback. Forwarded verbatim; interpretation is
    /// the state machine's job.
    pub fn on_region_entered(&self, group_id: &str) -> RegionEvent {
        debug!("[GeofenceScheduler] region entered: {}", group_id);
        RegionEvent::Entered {
            group_id: group_id.to_string(),
        }
    }

    /// Normalize a raw exit callback.
    pub fn on_region_exited(&self, group_id: &str) -> RegionEvent {
        debug!("[GeofenceScheduler] region exited: {}", group_id);
        RegionEvent::Exited {
            group_id: group_id.to_string(),
        }
    }

    /// Unregister everything (session teardown or degraded mode).
    pub fn clear(&mut self) {
        for group_id in self.registrations.keys() {
            if let Err(err) = self.monitor.unregister(group_id) {
                warn!("[GeofenceScheduler] unregister {} failed: {}", group_id, err);
            }
        }
        if !self.registrations.is_empty() {
            info!(
                "[GeofenceScheduler] cleared {} registrations",
                self.registrations.len()
            );
        }
        self.registrations.clear();
    }

    /// Currently registered group ids.
    pub fn registered_ids(&self) -> Vec<String> {
        self.registrations.keys().cloned().collect()
    }

    /// Registration details for a group, if monitored.
    pub fn registration(&self, group_id: &str) -> Option<&GeofenceRegistration> {
        self.registrations.get(group_id)
    }

    /// Number of active registrations.
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }
}

// ============================================================================
// In-Memory Monitor
// ============================================================================

#[derive(Debug, Default)]
struct MonitorState {
    available: bool,
    registered: HashMap<String, GeofenceRegistration>,
    register_calls: usize,
    unregister_calls: usize,
}

/// In-memory [`RegionMonitor`] for tests and hosts without a geofencing
/// capability. Clones share state, so a test can keep a handle while the
/// scheduler owns the boxed monitor.
#[derive(Debug, Clone)]
pub struct MemoryRegionMonitor {
    state: Arc<Mutex<MonitorState>>,
}

impl MemoryRegionMonitor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                available: true,
                ..MonitorState::default()
            })),
        }
    }

    /// A monitor that reports the capability as unavailable.
    pub fn unavailable() -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState::default())),
        }
    }

    pub fn set_available(&self, available: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.available = available;
        }
    }

    pub fn registered_count(&self) -> usize {
        self.state.lock().map(|s| s.registered.len()).unwrap_or(0)
    }

    pub fn is_registered(&self, group_id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.registered.contains_key(group_id))
            .unwrap_or(false)
    }

    /// Total register calls issued (idempotency checks).
    pub fn register_calls(&self) -> usize {
        self.state.lock().map(|s| s.register_calls).unwrap_or(0)
    }

    /// Total unregister calls issued.
    pub fn unregister_calls(&self) -> usize {
        self.state.lock().map(|s| s.unregister_calls).unwrap_or(0)
    }
}

impl Default for MemoryRegionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionMonitor for MemoryRegionMonitor {
    fn is_available(&self) -> bool {
        self.state.lock().map(|s| s.available).unwrap_or(false)
    }

    fn register(&mut self, registration: &GeofenceRegistration) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| PresenceError::Internal {
            message: "monitor state poisoned".to_string(),
        })?;
        state.register_calls += 1;
        state
            .registered
            .insert(registration.group_id.clone(), registration.clone());
        Ok(())
    }

    fn unregister(&mut self, group_id: &str) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| PresenceError::Internal {
            message: "monitor state poisoned".to_string(),
        })?;
        state.unregister_calls += 1;
        state.registered.remove(group_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DisplayMode;

    /// Group with a ~44m square boundary whose south-west corner is at
    /// (lat, lon).
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
            DisplayMode::Count,
        )
        .unwrap()
    }

    fn scheduler_with_monitor() -> (GeofenceScheduler, MemoryRegionMonitor) {
        let monitor = MemoryRegionMonitor::new();
        let scheduler = GeofenceScheduler::new(Box::new(monitor.clone()), &EngineConfig::default());
        (scheduler, monitor)
    }

    #[test]
    fn test_selects_twenty_nearest_of_twenty_five() {
        let (mut scheduler, monitor) = scheduler_with_monitor();

        // Groups marching north, nearest first
        let groups: Vec<Group> = (0..25)
            .map(|i| group_at(&format!("g{:02}", i), i as f64 * 0.01, 0.0))
            .collect();
        let location = GeoPoint::new(0.0, 0.0);

        let outcome = scheduler.reconcile(&groups, &location).unwrap();
        assert_eq!(outcome.registered.len(), 20);
        assert_eq!(scheduler.registration_count(), 20);
        assert_eq!(monitor.registered_count(), 20);

        // The 20 nearest are g00..g19; the 5 farthest are not monitored
        for i in 0..20 {
            assert!(monitor.is_registered(&format!("g{:02}", i)));
        }
        for i in 20..25 {
            assert!(!monitor.is_registered(&format!("g{:02}", i)));
        }
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (mut scheduler, monitor) = scheduler_with_monitor();
        let groups: Vec<Group> = (0..5)
            .map(|i| group_at(&format!("g{}", i), i as f64 * 0.01, 0.0))
            .collect();
        let location = GeoPoint::new(0.0, 0.0);

        scheduler.reconcile(&groups, &location).unwrap();
        let calls_after_first = monitor.register_calls();

        let outcome = scheduler.reconcile(&groups, &location).unwrap();
        assert!(outcome.is_noop());
        assert_eq!(outcome.retained.len(), 5);
        assert_eq!(monitor.register_calls(), calls_after_first);
        assert_eq!(monitor.unregister_calls(), 0);
    }

    #[test]
    fn test_moving_swaps_registrations() {
        let monitor = MemoryRegionMonitor::new();
        let mut config = EngineConfig::default();
        config.region_ceiling = 1;
        let mut scheduler = GeofenceScheduler::new(Box::new(monitor.clone()), &config);

        let groups = vec![group_at("north", 0.5, 0.0), group_at("south", -0.5, 0.0)];

        scheduler
            .reconcile(&groups, &GeoPoint::new(0.4, 0.0))
            .unwrap();
        assert!(monitor.is_registered("north"));
        assert!(!monitor.is_registered("south"));

        let outcome = scheduler
            .reconcile(&groups, &GeoPoint::new(-0.4, 0.0))
            .unwrap();
        assert_eq!(outcome.registered, vec!["south".to_string()]);
        assert_eq!(outcome.unregistered, vec!["north".to_string()]);
        assert!(monitor.is_registered("south"));
        assert!(!monitor.is_registered("north"));
    }

    #[test]
    fn test_distance_ties_break_on_group_id() {
        let monitor = MemoryRegionMonitor::new();
        let mut config = EngineConfig::default();
        config.region_ceiling = 1;
        let mut scheduler = GeofenceScheduler::new(Box::new(monitor.clone()), &config);

        // Mirror the northern boundary vertex-for-vertex across the equator
        // so both centroids are exactly equidistant; the lower group id wins
        let north = group_at("b-group", 0.1, 0.0);
        let mirrored: Vec<GeoPoint> = north
            .boundary
            .iter()
            .map(|p| GeoPoint::new(-p.latitude, p.longitude))
            .collect();
        let south = Group::new("a-group", "a-group", mirrored, DisplayMode::Count).unwrap();

        scheduler
            .reconcile(&[north, south], &GeoPoint::new(0.0, 0.0))
            .unwrap();

        assert_eq!(scheduler.registered_ids(), vec!["a-group".to_string()]);
        assert!(monitor.is_registered("a-group"));
    }

    #[test]
    fn test_radius_clamped_to_platform_range() {
        let (mut scheduler, _monitor) = scheduler_with_monitor();
        let groups = vec![group_at("small", 0.0, 0.0)];

        scheduler
            .reconcile(&groups, &GeoPoint::new(0.0, 0.0))
            .unwrap();

        // A ~44m square has a half-diagonal of ~31m; clamped up to 100m
        let registration = scheduler.registration("small").unwrap();
        assert_eq!(registration.radius_m, 100.0);
    }

    #[test]
    fn test_unavailable_monitor_clears_and_reports() {
        let monitor = MemoryRegionMonitor::unavailable();
        let mut scheduler =
            GeofenceScheduler::new(Box::new(monitor.clone()), &EngineConfig::default());
        let groups = vec![group_at("g1", 0.0, 0.0)];

        let result = scheduler.reconcile(&groups, &GeoPoint::new(0.0, 0.0));
        assert!(matches!(
            result,
            Err(PresenceError::GeofencingUnavailable { .. })
        ));
        assert_eq!(scheduler.registration_count(), 0);
    }

    #[test]
    fn test_boundary_edit_reissues_registration() {
        let (mut scheduler, monitor) = scheduler_with_monitor();
        let group = group_at("g1", 0.0, 0.0);
        let location = GeoPoint::new(0.0, 0.0);

        scheduler.reconcile(&[group.clone()], &location).unwrap();
        let calls_after_first = monitor.register_calls();

        // Same group, moved boundary
        let moved = group_at("g1", 0.02, 0.0);
        let outcome = scheduler.reconcile(&[moved], &location).unwrap();
        assert_eq!(outcome.registered, vec!["g1".to_string()]);
        assert_eq!(monitor.register_calls(), calls_after_first + 1);
    }

    #[test]
    fn test_clear_unregisters_everything() {
        let (mut scheduler, monitor) = scheduler_with_monitor();
        let groups: Vec<Group> = (0..3)
            .map(|i| group_at(&format!("g{}", i), i as f64 * 0.01, 0.0))
            .collect();

        scheduler
            .reconcile(&groups, &GeoPoint::new(0.0, 0.0))
            .unwrap();
        assert_eq!(monitor.registered_count(), 3);

        scheduler.clear();
        assert_eq!(monitor.registered_count(), 0);
        assert_eq!(scheduler.registration_count(), 0);
    }

    #[test]
    fn test_region_events_forwarded_verbatim() {
        let (scheduler, _monitor) = scheduler_with_monitor();

        assert_eq!(
            scheduler.on_region_entered("g1"),
            RegionEvent::Entered {
                group_id: "g1".to_string()
            }
        );
        assert_eq!(
            scheduler.on_region_exited("g1"),
            RegionEvent::Exited {
                group_id: "g1".to_string()
            }
        );
    }
}
