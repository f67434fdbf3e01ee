//! Analytics, achievement and observer surfaces.
//!
//! Everything the engine produces for the outside world flows through the
//! traits here: fire-and-forget analytics events, the per-check-in
//! achievement notice, and the session observer interface that replaces
//! implicit global state binding.

use log::info;
use serde::{Deserialize, Serialize};

use crate::PresenceRecord;

/// Structured analytics event, serialized with a snake_case `event` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    CheckIn {
        group_id: String,
        is_manual: bool,
    },
    CheckOut {
        group_id: String,
        is_manual: bool,
        duration_minutes: i64,
    },
    AutoCheckOut {
        group_id: String,
        duration_minutes: i64,
    },
}

impl AnalyticsEvent {
    /// The event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            AnalyticsEvent::CheckIn { .. } => "check_in",
            AnalyticsEvent::CheckOut { .. } => "check_out",
            AnalyticsEvent::AutoCheckOut { .. } => "auto_check_out",
        }
    }
}

/// Fire-and-forget analytics consumer. Implementations must not block the
/// presence pipeline; failures are their own concern.
pub trait AnalyticsSink: Send + Sync {
    fn record(&self, event: &AnalyticsEvent);
}

/// Default sink that writes structured JSON through the `log` facade.
pub struct LogAnalytics;

impl AnalyticsSink for LogAnalytics {
    fn record(&self, event: &AnalyticsEvent) {
        let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
        info!("[Analytics] {}", payload);
    }
}

/// Notification sent to the achievement engine on every presence check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct CheckInNotice {
    pub user_id: String,
    pub group_id: String,
    pub timestamp: i64,
    pub won_first_arrival: bool,
}

/// Consumer of check-in notices (the achievement engine collaborator).
pub trait AchievementSink: Send + Sync {
    fn on_check_in(&self, notice: &CheckInNotice);
}

/// State change published to session observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A presence record changed through a state-machine transition
    PresenceChanged { record: PresenceRecord },
    /// The monitored-region set was reconciled
    GeofencesReconciled {
        registered: Vec<String>,
        unregistered: Vec<String>,
    },
    /// Region monitoring became unavailable; the session is manual-only
    GeofencingDegraded { reason: String },
}

/// Explicit subscription interface for session state changes.
pub trait SessionObserver: Send {
    fn on_event(&self, event: &SessionEvent);
}
