//! FFI bindings for mobile platforms (iOS/Android).
//!
//! This module provides the UniFFI bindings that expose the presence engine
//! to Kotlin and Swift. The host implements [`PlatformRegionMonitor`] to
//! bridge its geofencing capability; the engine drives it through the
//! scheduler. One session slot exists per process: the FFI layer owns the
//! singleton, the core stays explicit-instance.

use std::sync::{Arc, Mutex};

use log::{info, warn};
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::arbiter::ClaimOutcome;
use crate::error::{PresenceError, Result};
use crate::events::LogAnalytics;
use crate::init_logging;
use crate::reconciler::format_summary;
use crate::scheduler::{GeofenceRegistration, LocationPermission, RegionEvent, RegionMonitor};
use crate::session::{PresenceSession, SessionStats};
use crate::storage::{MemoryPresenceStore, PresenceStore};
use crate::{AutoCheckoutDuration, DisplayMode, EngineConfig, GeoPoint, Group};

// ============================================================================
// Platform Capability Bridge
// ============================================================================

/// Region-monitoring capability implemented by the host platform.
/// Implement this in Kotlin/Swift over GeofencingClient or CoreLocation.
#[uniffi::export(callback_interface)]
pub trait PlatformRegionMonitor: Send + Sync {
    /// Whether region monitoring is currently usable.
    fn is_available(&self) -> bool;

    /// Start monitoring a circular region. Returns false if the platform
    /// rejected the registration.
    fn register(&self, group_id: String, latitude: f64, longitude: f64, radius_m: f64) -> bool;

    /// Stop monitoring the region for a group. Must be idempotent.
    fn unregister(&self, group_id: String);
}

/// Adapts the host callback to the engine's [`RegionMonitor`] contract.
struct CallbackRegionMonitor {
    callback: Box<dyn PlatformRegionMonitor>,
}

impl RegionMonitor for CallbackRegionMonitor {
    fn is_available(&self) -> bool {
        self.callback.is_available()
    }

    fn register(&mut self, registration: &GeofenceRegistration) -> Result<()> {
        let accepted = self.callback.register(
            registration.group_id.clone(),
            registration.center.latitude,
            registration.center.longitude,
            registration.radius_m,
        );
        if accepted {
            Ok(())
        } else {
            Err(PresenceError::GeofencingUnavailable {
                reason: "platform rejected region registration".to_string(),
            })
        }
    }

    fn unregister(&mut self, group_id: &str) -> Result<()> {
        self.callback.unregister(group_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Session Slot
// ============================================================================

/// Process-wide session slot. The core has no globals; this is the FFI
/// layer's one piece of shared state, filled at sign-in and emptied at
/// sign-out.
static SESSION: Lazy<Mutex<Option<PresenceSession>>> = Lazy::new(|| Mutex::new(None));

/// Run a closure against the active session, if any.
fn with_session<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut PresenceSession) -> R,
{
    let mut slot = SESSION.lock().unwrap();
    slot.as_mut().map(f)
}

fn open_store(db_path: Option<String>) -> Result<Arc<dyn PresenceStore>> {
    #[cfg(feature = "persistence")]
    if let Some(path) = &db_path {
        return Ok(Arc::new(crate::persistence::SqlitePresenceStore::open(path)?));
    }

    #[cfg(not(feature = "persistence"))]
    if db_path.is_some() {
        warn!("[PresenceEngineRust] built without persistence; using in-memory store");
    }

    Ok(Arc::new(MemoryPresenceStore::new()))
}

/// Group definition accepted over the FFI boundary. The boundary is
/// validated and the centroid derived on this side.
#[derive(Debug, Deserialize)]
struct GroupConfig {
    group_id: String,
    name: String,
    boundary: Vec<GeoPoint>,
    display_mode: DisplayMode,
}

// ============================================================================
// Session Lifecycle
// ============================================================================

/// Start a session for a signed-in user. Replaces any previous session
/// (tearing its registrations down first).
#[uniffi::export]
pub fn session_start(
    user_id: String,
    display_name: String,
    monitor: Box<dyn PlatformRegionMonitor>,
    db_path: Option<String>,
) -> bool {
    init_logging();

    let store = match open_store(db_path) {
        Ok(store) => store,
        Err(err) => {
            warn!("[PresenceEngineRust] session start failed: {}", err);
            return false;
        }
    };

    let session = PresenceSession::new(
        &user_id,
        &display_name,
        store,
        Box::new(CallbackRegionMonitor { callback: monitor }),
        EngineConfig::default(),
    )
    .with_analytics(Box::new(LogAnalytics));

    let mut slot = SESSION.lock().unwrap();
    if let Some(previous) = slot.take() {
        previous.sign_out();
    }
    *slot = Some(session);

    info!("[PresenceEngineRust] session started for {}", user_id);
    true
}

/// End the active session, clearing every geofence registration and pending
/// deadline.
#[uniffi::export]
pub fn session_end() {
    let mut slot = SESSION.lock().unwrap();
    if let Some(session) = slot.take() {
        session.sign_out();
        info!("[PresenceEngineRust] session ended");
    }
}

/// Replace the session's groups from a JSON array of
/// `{group_id, name, boundary, display_mode}`. Returns the number of groups
/// accepted; invalid boundaries are rejected and logged.
#[uniffi::export]
pub fn session_set_groups_json(groups_json: String) -> u32 {
    let configs: Vec<GroupConfig> = match serde_json::from_str(&groups_json) {
        Ok(configs) => configs,
        Err(err) => {
            warn!("[PresenceEngineRust] groups JSON malformed: {}", err);
            return 0;
        }
    };

    let mut groups = Vec::new();
    for config in configs {
        match Group::new(
            &config.group_id,
            &config.name,
            config.boundary,
            config.display_mode,
        ) {
            Ok(group) => groups.push(group),
            Err(err) => warn!("[PresenceEngineRust] group rejected: {}", err),
        }
    }

    let accepted = groups.len() as u32;
    with_session(|s| s.set_groups(groups));
    accepted
}

// ============================================================================
// Location & Signals
// ============================================================================

/// Report the current location permission level.
#[uniffi::export]
pub fn session_set_permission(permission: LocationPermission) {
    with_session(|s| s.set_permission(permission));
}

/// Reconcile monitored regions against a fresh location fix.
#[uniffi::export]
pub fn session_update_location(latitude: f64, longitude: f64) {
    with_session(|s| {
        if let Err(err) = s.update_location(&GeoPoint::new(latitude, longitude)) {
            warn!("[PresenceEngineRust] location update failed: {}", err);
        }
    });
}

/// Manual check-in. `checkout_minutes` must be one of the selectable
/// durations; anything else falls back to the default.
#[uniffi::export]
pub fn session_check_in(group_id: String, checkout_minutes: Option<u32>) -> Option<ClaimOutcome> {
    let duration = match checkout_minutes {
        Some(minutes) => match AutoCheckoutDuration::from_minutes(minutes) {
            Some(duration) => duration,
            None => {
                warn!(
                    "[PresenceEngineRust] {} is not a selectable checkout duration; using default",
                    minutes
                );
                AutoCheckoutDuration::default()
            }
        },
        None => AutoCheckoutDuration::default(),
    };

    with_session(|s| match s.check_in_with(&group_id, duration) {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            warn!("[PresenceEngineRust] check-in failed: {}", err);
            None
        }
    })
    .flatten()
}

/// Manual check-out.
#[uniffi::export]
pub fn session_check_out(group_id: String) -> bool {
    with_session(|s| match s.check_out(&group_id) {
        Ok(()) => true,
        Err(err) => {
            warn!("[PresenceEngineRust] check-out failed: {}", err);
            false
        }
    })
    .unwrap_or(false)
}

/// Platform region-entry callback.
#[uniffi::export]
pub fn session_region_entered(group_id: String) {
    with_session(|s| {
        if let Err(err) = s.handle_region_event(RegionEvent::Entered { group_id }) {
            warn!("[PresenceEngineRust] region entry failed: {}", err);
        }
    });
}

/// Platform region-exit callback.
#[uniffi::export]
pub fn session_region_exited(group_id: String) {
    with_session(|s| {
        if let Err(err) = s.handle_region_event(RegionEvent::Exited { group_id }) {
            warn!("[PresenceEngineRust] region exit failed: {}", err);
        }
    });
}

/// Periodic/resume hook: evaluates pending deadlines and retries queued
/// writes. Call on app foreground and on a coarse timer.
#[uniffi::export]
pub fn session_tick() {
    with_session(|s| s.tick());
}

// ============================================================================
// Summaries
// ============================================================================

/// Feed a remote presence snapshot (JSON array of presence records).
#[uniffi::export]
pub fn session_apply_remote_snapshot_json(group_id: String, records_json: String) -> bool {
    let records = match serde_json::from_str(&records_json) {
        Ok(records) => records,
        Err(err) => {
            warn!("[PresenceEngineRust] snapshot JSON malformed: {}", err);
            return false;
        }
    };
    with_session(|s| s.apply_remote_snapshot(&group_id, records)).is_some()
}

/// Presence summary for a group as JSON.
#[uniffi::export]
pub fn session_summary_json(group_id: String) -> String {
    with_session(|s| {
        let summary = s.summary(&group_id);
        serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string())
    })
    .unwrap_or_else(|| "{}".to_string())
}

/// Display-ready summary line for a group, honoring its display mode.
#[uniffi::export]
pub fn session_summary_text(group_id: String) -> String {
    with_session(|s| {
        let mode = s
            .group(&group_id)
            .map(|g| g.display_mode)
            .unwrap_or(DisplayMode::Count);
        let summary = s.summary(&group_id);
        format_summary(&summary, mode)
    })
    .unwrap_or_else(|| "No one here".to_string())
}

/// Session statistics, or None if no session is active.
#[uniffi::export]
pub fn session_stats() -> Option<SessionStats> {
    with_session(|s| s.stats())
}
