//! # Presence Engine
//!
//! Presence tracking and geofence coordination for location-based groups.
//!
//! This library provides:
//! - Boundary validation and geometric reasoning for group areas
//! - Monitored-region scheduling under the platform's geofence ceiling
//! - A per-(user, group) presence state machine with manual override,
//!   throttling and deadline-based auto-checkout
//! - Atomic first-arrival-of-the-day arbitration
//! - Reconciliation of local optimistic state with the remote snapshot
//!
//! ## Features
//!
//! - **`persistence`** - SQLite-backed presence store
//! - **`ffi`** - FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use presence_engine::{DisplayMode, GeoPoint, Group};
//!
//! // A roughly 44m square around a clubhouse
//! let boundary = vec![
//!     GeoPoint::new(51.5074, -0.1278),
//!     GeoPoint::new(51.5074, -0.1274),
//!     GeoPoint::new(51.5078, -0.1274),
//!     GeoPoint::new(51.5078, -0.1278),
//! ];
//!
//! let group = Group::new("club-1", "Clubhouse", boundary, DisplayMode::Names).unwrap();
//! assert!(group.contains(&GeoPoint::new(51.5076, -0.1276)));
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{BoundaryError, OptionExt, PresenceError, Result};

// Geographic utilities (distance calculations)
pub mod geo_utils;

// Boundary geometry (validation, area, centroid, containment)
pub mod geometry;

// Monitored-region scheduling under the platform ceiling
pub mod scheduler;
pub use scheduler::{
    GeofenceRegistration, GeofenceScheduler, LocationPermission, MemoryRegionMonitor,
    ReconcileOutcome, RegionEvent, RegionMonitor, RegistrationStatus,
};

// Per-(user, group) presence state machine
pub mod state_machine;
pub use state_machine::{
    IgnoreReason, PresenceMachine, PresenceSignal, PresenceState, SignalOutcome, TransitionEffect,
};

// Stale-presence classification
pub mod reaper;
pub use reaper::{effective_presence, is_stale, MAX_PRESENCE_SECS};

// First-arrival-of-the-day arbitration
pub mod arbiter;
pub use arbiter::{claim_date, ClaimOutcome, DailyArrivalClaim, FirstArrivalArbiter};

// Remote/local presence reconciliation and display summaries
pub mod reconciler;
pub use reconciler::{format_summary, merge_records, PresenceSummary, PresenceSyncReconciler};

// Presence storage contract + in-memory reference implementation
pub mod storage;
pub use storage::{MemoryPresenceStore, PresenceStore};

// Analytics, achievement and observer surfaces
pub mod events;
pub use events::{
    AchievementSink, AnalyticsEvent, AnalyticsSink, CheckInNotice, LogAnalytics, SessionEvent,
    SessionObserver,
};

// Session object owning all per-sign-in state
pub mod session;
pub use session::{PresenceSession, SessionStats};

// SQLite-backed presence store
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqlitePresenceStore;

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("PresenceEngineRust"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A geographic coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use presence_engine::GeoPoint;
/// let point = GeoPoint::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new geographic point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Bounding box for a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from a set of points.
    pub fn from_points(points: &[GeoPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }
}

/// How a group's presence summary is rendered to members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum DisplayMode {
    /// Aggregate count only ("3 people here")
    Count,
    /// Named member list
    Names,
}

/// A geographic group: an identity, a validated boundary and a display mode.
///
/// Groups are created by an external collaborator and read-only to the
/// engine. The boundary is immutable once the group exists except via
/// [`Group::with_boundary`], which re-validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Group {
    pub group_id: String,
    pub name: String,
    /// Ordered boundary vertices (implicitly closed)
    pub boundary: Vec<GeoPoint>,
    /// Vertex-mean centroid, derived at construction
    pub centroid: GeoPoint,
    pub display_mode: DisplayMode,
}

impl Group {
    /// Create a group, validating the boundary and deriving the centroid.
    pub fn new(
        group_id: &str,
        name: &str,
        boundary: Vec<GeoPoint>,
        display_mode: DisplayMode,
    ) -> Result<Self> {
        geometry::validate(&boundary).map_err(|reason| PresenceError::InvalidBoundary {
            group_id: group_id.to_string(),
            reason,
        })?;

        let centroid = geometry::centroid(&boundary);

        Ok(Self {
            group_id: group_id.to_string(),
            name: name.to_string(),
            boundary,
            centroid,
            display_mode,
        })
    }

    /// Produce a copy of this group with an edited boundary.
    ///
    /// The new boundary goes through full validation; the centroid is
    /// recomputed.
    pub fn with_boundary(&self, boundary: Vec<GeoPoint>) -> Result<Self> {
        geometry::validate(&boundary).map_err(|reason| PresenceError::InvalidBoundary {
            group_id: self.group_id.clone(),
            reason,
        })?;

        let centroid = geometry::centroid(&boundary);

        Ok(Self {
            boundary,
            centroid,
            ..self.clone()
        })
    }

    /// Test whether a point lies within the group's boundary.
    pub fn contains(&self, point: &GeoPoint) -> bool {
        geometry::contains(point, &self.boundary)
    }

    /// Bounding box of the boundary.
    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(&self.boundary)
    }
}

/// The stored fact that a user is (or was) present at a group.
///
/// One logical record exists per (user, group). The authoritative copy lives
/// in storage; the state machine holds a local optimistic copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct PresenceRecord {
    pub user_id: String,
    pub group_id: String,
    pub is_present: bool,
    /// Set by explicit user action; automatic signals may not override it
    pub is_manual: bool,
    /// Unix timestamp (seconds) of the last transition
    pub last_updated: i64,
    pub display_name: String,
}

/// Auto-checkout duration after a manual check-in.
///
/// The option set is fixed; arbitrary durations are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum AutoCheckoutDuration {
    Min15,
    Min30,
    Min60,
    Min120,
    Min240,
}

impl AutoCheckoutDuration {
    /// All selectable durations, shortest first.
    pub const ALL: [AutoCheckoutDuration; 5] = [
        AutoCheckoutDuration::Min15,
        AutoCheckoutDuration::Min30,
        AutoCheckoutDuration::Min60,
        AutoCheckoutDuration::Min120,
        AutoCheckoutDuration::Min240,
    ];

    /// Duration in minutes.
    pub fn minutes(&self) -> u32 {
        match self {
            AutoCheckoutDuration::Min15 => 15,
            AutoCheckoutDuration::Min30 => 30,
            AutoCheckoutDuration::Min60 => 60,
            AutoCheckoutDuration::Min120 => 120,
            AutoCheckoutDuration::Min240 => 240,
        }
    }

    /// Duration in seconds.
    pub fn seconds(&self) -> i64 {
        self.minutes() as i64 * 60
    }

    /// Parse a minute count, rejecting anything outside the option set.
    pub fn from_minutes(minutes: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.minutes() == minutes)
    }
}

impl Default for AutoCheckoutDuration {
    fn default() -> Self {
        AutoCheckoutDuration::Min60
    }
}

/// Fixed configuration surface for the engine.
///
/// These values are construction-time constants: the engine never tunes them
/// at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct EngineConfig {
    /// Platform ceiling on concurrently monitored regions.
    /// Default: 20
    pub region_ceiling: u32,

    /// Minimum time between accepted automatic presence updates for the same
    /// (user, group). Default: 30 seconds
    pub throttle_window_secs: i64,

    /// Auto-checkout duration applied when the user does not choose one.
    pub default_checkout: AutoCheckoutDuration,

    /// Bounded retry count for the first-arrival conditional write.
    /// Default: 3
    pub claim_retry_limit: u32,

    /// Smallest radius the platform accepts for a monitored region.
    /// Default: 100 meters
    pub min_region_radius_m: f64,

    /// Largest radius the platform accepts for a monitored region.
    /// Default: 2000 meters
    pub max_region_radius_m: f64,

    /// Bounded retry count for transient presence-record writes.
    /// Default: 3
    pub write_retry_limit: u32,

    /// Backoff step between write retries, in milliseconds.
    /// Default: 50
    pub write_backoff_step_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            region_ceiling: 20,
            throttle_window_secs: 30,
            default_checkout: AutoCheckoutDuration::Min60,
            claim_retry_limit: 3,
            min_region_radius_m: 100.0,
            max_region_radius_m: 2000.0,
            write_retry_limit: 3,
            write_backoff_step_ms: 50,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_boundary() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(51.5074, -0.1278),
            GeoPoint::new(51.5074, -0.1274),
            GeoPoint::new(51.5078, -0.1274),
            GeoPoint::new(51.5078, -0.1278),
        ]
    }

    #[test]
    fn test_geo_point_validation() {
        assert!(GeoPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, 181.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_group_creation() {
        let group = Group::new("g1", "Clubhouse", sample_boundary(), DisplayMode::Names);
        assert!(group.is_ok());

        let group = group.unwrap();
        assert_eq!(group.group_id, "g1");
        // Centroid lands in the middle of the square
        assert!((group.centroid.latitude - 51.5076).abs() < 1e-9);
        assert!((group.centroid.longitude + 0.1276).abs() < 1e-9);
    }

    #[test]
    fn test_group_rejects_bad_boundary() {
        let result = Group::new(
            "g1",
            "Too thin",
            vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 1.0)],
            DisplayMode::Count,
        );
        assert!(matches!(
            result,
            Err(PresenceError::InvalidBoundary { .. })
        ));
    }

    #[test]
    fn test_group_boundary_edit_revalidates() {
        let group =
            Group::new("g1", "Clubhouse", sample_boundary(), DisplayMode::Names).unwrap();

        // A collinear edit is rejected; the original group is untouched
        let bad = group.with_boundary(vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 0.001),
            GeoPoint::new(0.0, 0.002),
        ]);
        assert!(bad.is_err());
        assert_eq!(group.boundary.len(), 4);

        // A valid edit recomputes the centroid
        let mut shifted = sample_boundary();
        for p in &mut shifted {
            p.latitude += 0.001;
        }
        let edited = group.with_boundary(shifted).unwrap();
        assert!(edited.centroid.latitude > group.centroid.latitude);
    }

    #[test]
    fn test_bounds_from_points() {
        let bounds = Bounds::from_points(&sample_boundary()).unwrap();
        assert_eq!(bounds.min_lat, 51.5074);
        assert_eq!(bounds.max_lat, 51.5078);
        assert_eq!(bounds.min_lng, -0.1278);
        assert_eq!(bounds.max_lng, -0.1274);

        assert!(Bounds::from_points(&[]).is_none());
    }

    #[test]
    fn test_auto_checkout_duration_options() {
        assert_eq!(AutoCheckoutDuration::default().minutes(), 60);
        assert_eq!(AutoCheckoutDuration::from_minutes(15), Some(AutoCheckoutDuration::Min15));
        assert_eq!(AutoCheckoutDuration::from_minutes(240), Some(AutoCheckoutDuration::Min240));
        assert_eq!(AutoCheckoutDuration::from_minutes(45), None);
        assert_eq!(AutoCheckoutDuration::Min120.seconds(), 7200);
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.region_ceiling, 20);
        assert_eq!(config.throttle_window_secs, 30);
        assert_eq!(config.default_checkout, AutoCheckoutDuration::Min60);
    }
}
