//! Per-(user, group) presence state machine.
//!
//! One [`PresenceMachine`] reconciles manual actions and automatic region
//! signals for a single (user, group) key. Manual state wins over automatic
//! signals, automatic signals are throttled, and manual check-ins expire at
//! an absolute deadline that is evaluated lazily (on resume, on a periodic
//! tick, or on any read) rather than via a sleeping timer, so a suspended
//! host still converges on the correct state at the next evaluation.
//!
//! The machine is pure in `now`: callers supply the clock, which keeps every
//! timing rule directly testable.

use serde::{Deserialize, Serialize};

use crate::events::AnalyticsEvent;
use crate::scheduler::LocationPermission;
use crate::{AutoCheckoutDuration, PresenceRecord};

/// Minimum time between accepted automatic presence updates for the same
/// (user, group): 30 seconds.
pub const THROTTLE_WINDOW_SECS: i64 = 30;

/// Presence state for one (user, group) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum PresenceState {
    Absent,
    PresentManual,
    PresentAuto,
}

impl PresenceState {
    pub fn is_present(&self) -> bool {
        !matches!(self, PresenceState::Absent)
    }
}

/// Input signal consumed by the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSignal {
    /// Explicit user check-in with a chosen auto-checkout duration
    ManualCheckIn { duration: AutoCheckoutDuration },
    /// Explicit user check-out
    ManualCheckOut,
    /// Device entered the group's monitored region
    RegionEntered,
    /// Device left the group's monitored region
    RegionExited,
    /// Lazy evaluation of the auto-checkout deadline
    DeadlineCheck,
}

/// Why a signal produced no transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Manual presence wins over automatic signals
    ManualOverride,
    /// Last write for this key was inside the throttle window
    Throttled,
    /// Automatic entry requires continuous location permission
    NoPermission,
    /// No deadline has passed
    NotDue,
    /// The signal would not change the record
    NoChange,
}

/// Everything an applied transition asks the caller to do.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionEffect {
    /// Updated record to upsert into presence storage
    pub record: PresenceRecord,
    /// Whether the first-arrival arbiter should be invoked
    pub claim_first_arrival: bool,
    /// Analytics event to emit, if any
    pub analytics: Option<AnalyticsEvent>,
}

/// Result of feeding one signal to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Applied(TransitionEffect),
    Ignored(IgnoreReason),
}

impl SignalOutcome {
    /// The effect, if the signal was applied.
    pub fn effect(self) -> Option<TransitionEffect> {
        match self {
            SignalOutcome::Applied(effect) => Some(effect),
            SignalOutcome::Ignored(_) => None,
        }
    }
}

/// State machine instance for one (user, group) key.
#[derive(Debug, Clone)]
pub struct PresenceMachine {
    user_id: String,
    group_id: String,
    display_name: String,
    state: PresenceState,
    /// Absolute auto-checkout deadline (unix seconds), manual state only
    checkout_deadline: Option<i64>,
    /// Timestamp of the transition into the current presence
    checkin_at: Option<i64>,
    /// Timestamp of the last applied write for this key
    last_write: Option<i64>,
    throttle_window_secs: i64,
}

impl PresenceMachine {
    pub fn new(user_id: &str, group_id: &str, display_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
            display_name: display_name.to_string(),
            state: PresenceState::Absent,
            checkout_deadline: None,
            checkin_at: None,
            last_write: None,
            throttle_window_secs: THROTTLE_WINDOW_SECS,
        }
    }

    /// Override the throttle window (session configuration).
    pub fn with_throttle_window(mut self, secs: i64) -> Self {
        self.throttle_window_secs = secs;
        self
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// The pending auto-checkout deadline, if a manual check-in is active.
    pub fn checkout_deadline(&self) -> Option<i64> {
        self.checkout_deadline
    }

    /// The machine's optimistic record, if any transition has been applied.
    pub fn local_record(&self) -> Option<PresenceRecord> {
        self.last_write.map(|written_at| PresenceRecord {
            user_id: self.user_id.clone(),
            group_id: self.group_id.clone(),
            is_present: self.state.is_present(),
            is_manual: self.state == PresenceState::PresentManual,
            last_updated: written_at,
            display_name: self.display_name.clone(),
        })
    }

    /// Feed one signal through the machine.
    ///
    /// `permission` is the current location permission; automatic entry is
    /// only honored under continuous (background) permission.
    pub fn apply(
        &mut self,
        signal: PresenceSignal,
        permission: LocationPermission,
        now: i64,
    ) -> SignalOutcome {
        match signal {
            PresenceSignal::ManualCheckIn { duration } => self.manual_check_in(duration, now),
            PresenceSignal::ManualCheckOut => self.manual_check_out(now),
            PresenceSignal::RegionEntered => self.region_entered(permission, now),
            PresenceSignal::RegionExited => self.region_exited(now),
            PresenceSignal::DeadlineCheck => self.deadline_check(now),
        }
    }

    fn manual_check_in(&mut self, duration: AutoCheckoutDuration, now: i64) -> SignalOutcome {
        // A repeated manual check-in refreshes the deadline
        self.state = PresenceState::PresentManual;
        self.checkin_at = Some(now);
        self.checkout_deadline = Some(now + duration.seconds());

        SignalOutcome::Applied(TransitionEffect {
            record: self.write(now),
            claim_first_arrival: true,
            analytics: Some(AnalyticsEvent::CheckIn {
                group_id: self.group_id.clone(),
                is_manual: true,
            }),
        })
    }

    fn manual_check_out(&mut self, now: i64) -> SignalOutcome {
        if self.state == PresenceState::Absent {
            return SignalOutcome::Ignored(IgnoreReason::NoChange);
        }

        let duration_minutes = self.present_minutes(now);
        self.state = PresenceState::Absent;
        self.checkout_deadline = None;
        self.checkin_at = None;

        SignalOutcome::Applied(TransitionEffect {
            record: self.write(now),
            claim_first_arrival: false,
            analytics: Some(AnalyticsEvent::CheckOut {
                group_id: self.group_id.clone(),
                is_manual: true,
                duration_minutes,
            }),
        })
    }

    fn region_entered(&mut self, permission: LocationPermission, now: i64) -> SignalOutcome {
        if permission != LocationPermission::Continuous {
            return SignalOutcome::Ignored(IgnoreReason::NoPermission);
        }
        if self.state == PresenceState::PresentManual {
            return SignalOutcome::Ignored(IgnoreReason::ManualOverride);
        }
        if self.throttled(now) {
            return SignalOutcome::Ignored(IgnoreReason::Throttled);
        }

        self.state = PresenceState::PresentAuto;
        self.checkin_at = Some(now);
        self.checkout_deadline = None;

        SignalOutcome::Applied(TransitionEffect {
            record: self.write(now),
            claim_first_arrival: true,
            analytics: Some(AnalyticsEvent::CheckIn {
                group_id: self.group_id.clone(),
                is_manual: false,
            }),
        })
    }

    fn region_exited(&mut self, now: i64) -> SignalOutcome {
        if self.state == PresenceState::PresentManual {
            return SignalOutcome::Ignored(IgnoreReason::ManualOverride);
        }
        if self.throttled(now) {
            return SignalOutcome::Ignored(IgnoreReason::Throttled);
        }
        if self.state == PresenceState::Absent {
            return SignalOutcome::Ignored(IgnoreReason::NoChange);
        }

        let duration_minutes = self.present_minutes(now);
        self.state = PresenceState::Absent;
        self.checkin_at = None;

        SignalOutcome::Applied(TransitionEffect {
            record: self.write(now),
            claim_first_arrival: false,
            analytics: Some(AnalyticsEvent::CheckOut {
                group_id: self.group_id.clone(),
                is_manual: false,
                duration_minutes,
            }),
        })
    }

    fn deadline_check(&mut self, now: i64) -> SignalOutcome {
        if self.state != PresenceState::PresentManual {
            return SignalOutcome::Ignored(IgnoreReason::NotDue);
        }
        let deadline = match self.checkout_deadline {
            Some(deadline) if now >= deadline => deadline,
            _ => return SignalOutcome::Ignored(IgnoreReason::NotDue),
        };

        // The record's logical end is the deadline itself, so a late
        // evaluation still reports the configured duration.
        let duration_minutes = self
            .checkin_at
            .map(|at| (deadline - at) / 60)
            .unwrap_or(0);

        self.state = PresenceState::Absent;
        self.checkout_deadline = None;
        self.checkin_at = None;

        SignalOutcome::Applied(TransitionEffect {
            record: self.write(now),
            claim_first_arrival: false,
            analytics: Some(AnalyticsEvent::AutoCheckOut {
                group_id: self.group_id.clone(),
                duration_minutes,
            }),
        })
    }

    /// Cancel any pending deadline (session teardown).
    pub fn cancel_deadline(&mut self) {
        self.checkout_deadline = None;
    }

    fn throttled(&self, now: i64) -> bool {
        self.last_write
            .map(|t| now - t < self.throttle_window_secs)
            .unwrap_or(false)
    }

    fn present_minutes(&self, now: i64) -> i64 {
        self.checkin_at.map(|at| (now - at) / 60).unwrap_or(0)
    }

    fn write(&mut self, now: i64) -> PresenceRecord {
        self.last_write = Some(now);
        PresenceRecord {
            user_id: self.user_id.clone(),
            group_id: self.group_id.clone(),
            is_present: self.state.is_present(),
            is_manual: self.state == PresenceState::PresentManual,
            last_updated: now,
            display_name: self.display_name.clone(),
        }
    }
}
