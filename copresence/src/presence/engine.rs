//! Local presence state machine.
//!
//! The engine is pure: callers pass the current [`Instant`] into every
//! method and act on what it returns. It emits only on transitions, so two
//! consecutive emissions never carry the same status.
//!
//! ```text
//!            session_opened            check_idle (>= threshold)
//! Offline ─────────────────► Online ──────────────────────────► Idle
//!    ▲                        ▲  │ ◄────────── input / report ────┘
//!    │ session_closed         │  │ set_do_not_disturb(true)
//!    └──────── any ◄──────────┘  ▼
//!                     set_dnd(false)  DoNotDisturb
//! ```

use std::time::{Duration, Instant};

use copresence_proto::presence::{Activity, PresenceStatus};

/// A status change, emitted exactly once per edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceTransition {
    /// Status before the edge.
    pub from: PresenceStatus,
    /// Status after the edge.
    pub to: PresenceStatus,
    /// Activity at the time of the edge.
    pub activity: Option<Activity>,
}

/// What an activity report produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutput {
    /// The report caused a status change (carrying the new activity).
    Transition(PresenceTransition),
    /// Status unchanged, activity replaced.
    ActivityChanged(Activity),
}

/// Presence state machine for the local user.
#[derive(Debug, Clone)]
pub struct PresenceEngine {
    status: PresenceStatus,
    activity: Option<Activity>,
    last_input: Option<Instant>,
    idle_threshold: Duration,
    held_activity: Option<Activity>,
}

impl PresenceEngine {
    /// Creates an offline engine that goes idle after `idle_threshold`.
    #[must_use]
    pub const fn new(idle_threshold: Duration) -> Self {
        Self {
            status: PresenceStatus::Offline,
            activity: None,
            last_input: None,
            idle_threshold,
            held_activity: None,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> PresenceStatus {
        self.status
    }

    /// Current activity.
    #[must_use]
    pub const fn activity(&self) -> Option<&Activity> {
        self.activity.as_ref()
    }

    /// `Offline -> Online`. Delivers any activity reported while offline.
    pub fn session_opened(&mut self, now: Instant) -> Option<PresenceTransition> {
        if self.status != PresenceStatus::Offline {
            return None;
        }
        self.last_input = Some(now);
        if let Some(held) = self.held_activity.take() {
            self.activity = Some(held);
        }
        Some(self.transition(PresenceStatus::Online))
    }

    /// `any -> Offline`. The local record is discarded, not persisted.
    pub fn session_closed(&mut self) -> Option<PresenceTransition> {
        if self.status == PresenceStatus::Offline {
            return None;
        }
        let emitted = self.transition(PresenceStatus::Offline);
        self.activity = None;
        self.last_input = None;
        Some(PresenceTransition {
            activity: None,
            ..emitted
        })
    }

    /// A raw input signal (pointer, key, scroll).
    ///
    /// Resets the idle timer; wakes the user from `Idle`. Ignored while
    /// offline or in do-not-disturb.
    pub fn observe_input(&mut self, now: Instant) -> Option<PresenceTransition> {
        match self.status {
            PresenceStatus::Offline | PresenceStatus::DoNotDisturb => None,
            PresenceStatus::Online => {
                self.last_input = Some(now);
                None
            }
            PresenceStatus::Idle => {
                self.last_input = Some(now);
                Some(self.transition(PresenceStatus::Online))
            }
        }
    }

    /// An explicit activity report.
    ///
    /// From `Idle` this is one atomic emission carrying both the status
    /// change and the activity. While offline the activity is held until the
    /// next session opens.
    pub fn report_activity(&mut self, activity: Activity, now: Instant) -> Option<EngineOutput> {
        match self.status {
            PresenceStatus::Offline => {
                self.held_activity = Some(activity);
                None
            }
            PresenceStatus::Idle => {
                self.last_input = Some(now);
                self.activity = Some(activity);
                Some(EngineOutput::Transition(
                    self.transition(PresenceStatus::Online),
                ))
            }
            PresenceStatus::Online | PresenceStatus::DoNotDisturb => {
                if self.status == PresenceStatus::Online {
                    self.last_input = Some(now);
                }
                if self.activity.as_ref() == Some(&activity) {
                    return None;
                }
                self.activity = Some(activity.clone());
                Some(EngineOutput::ActivityChanged(activity))
            }
        }
    }

    /// Periodic idle check. Fires once per idle period.
    pub fn check_idle(&mut self, now: Instant) -> Option<PresenceTransition> {
        if self.status != PresenceStatus::Online {
            return None;
        }
        let last = self.last_input?;
        if now.saturating_duration_since(last) < self.idle_threshold {
            return None;
        }
        Some(self.transition(PresenceStatus::Idle))
    }

    /// Enter or leave do-not-disturb. Only explicit user action does either.
    pub fn set_do_not_disturb(&mut self, enabled: bool, now: Instant) -> Option<PresenceTransition> {
        match (enabled, self.status) {
            (true, PresenceStatus::Online | PresenceStatus::Idle) => {
                Some(self.transition(PresenceStatus::DoNotDisturb))
            }
            (false, PresenceStatus::DoNotDisturb) => {
                self.last_input = Some(now);
                Some(self.transition(PresenceStatus::Online))
            }
            _ => None,
        }
    }

    fn transition(&mut self, to: PresenceStatus) -> PresenceTransition {
        let from = std::mem::replace(&mut self.status, to);
        tracing::debug!(%from, %to, "presence transition");
        PresenceTransition {
            from,
            to,
            activity: self.activity.clone(),
        }
    }
}
