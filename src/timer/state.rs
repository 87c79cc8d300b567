//! Timer identity and persisted state.
//!
//! `TimerState` is the plain value copy of a timer's bookkeeping. It is what
//! `state()` returns, what `restore_state()` installs and what a snapshot
//! stores per timer. The firing channel and the callback action are not part
//! of it; they stay bound to the live entry and are re-bound by id or token.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::validate_speed;
use crate::error::ValidationError;
use crate::time::VirtualInstant;

/// Stable identifier of a timer within its controller.
///
/// Ids are allocated in creation order, so ascending id order is creation
/// order. Ties between timers due at the same instant fire in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(u64);

impl TimerId {
    /// Wraps a raw id value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Periodic or one-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Fires every interval until stopped.
    Periodic,
    /// Fires once after its interval, then is done.
    OneShot,
}

/// Lifecycle position derived from a timer's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    /// Eligible for scheduling.
    Running,
    /// Individually paused; wall time does not erode its interval.
    Paused,
    /// Stopped by the caller, or restored in a stopped state.
    Stopped,
    /// One-shot timer that has fired.
    Fired,
}

/// Opaque name of a user action bound to a one-shot timer.
///
/// The engine never looks inside the action; it only remembers which token a
/// timer triggers, so a restored timer can be re-bound to the action
/// registered under the same token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(String);

impl CallbackToken {
    /// Creates a token from a caller-chosen name.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::EmptyCallbackToken` if the name is blank.
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ValidationError::EmptyCallbackToken);
        }
        Ok(Self(name))
    }

    /// Creates a fresh, random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("anon-{}", Uuid::new_v4()))
    }

    /// The token's name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value copy of a timer's bookkeeping.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerState {
    pub id: TimerId,
    pub kind: TimerKind,
    /// Period (periodic) or delay (one-shot), in the timer's own time.
    pub interval: Duration,
    /// Per-timer multiplier, composed with the controller's global speed.
    pub own_speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_last_fire: Option<VirtualInstant>,
    pub virtual_next_due: VirtualInstant,
    /// Own-time interval left, held while paused or at own speed zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<Duration>,
    pub tick_count: u64,
    pub running: bool,
    pub paused: bool,
    #[serde(default)]
    pub has_fired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<CallbackToken>,
}

impl TimerState {
    /// Derived lifecycle status.
    #[must_use]
    pub fn status(&self) -> TimerStatus {
        if self.has_fired {
            TimerStatus::Fired
        } else if !self.running {
            TimerStatus::Stopped
        } else if self.paused {
            TimerStatus::Paused
        } else {
            TimerStatus::Running
        }
    }

    /// True if the scheduler may fire this timer by waiting for its deadline.
    #[must_use]
    pub fn is_schedulable(&self) -> bool {
        self.running && !self.paused && !self.has_fired && self.own_speed > 0.0
    }

    /// Checks the structural invariants of a state value.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidSpeed` for a bad multiplier and
    /// `ValidationError::InvalidTimerState` for inconsistent fields.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_speed(self.own_speed)?;

        let invalid = |reason: &str| ValidationError::InvalidTimerState {
            reason: format!("{}: {reason}", self.id),
        };

        match self.kind {
            TimerKind::Periodic => {
                if self.interval.is_zero() {
                    return Err(invalid("periodic interval must be greater than zero"));
                }
                if self.has_fired {
                    return Err(invalid("periodic timers cannot be marked fired"));
                }
                if self.callback_token.is_some() {
                    return Err(invalid("periodic timers do not carry callback tokens"));
                }
            }
            TimerKind::OneShot => {
                if self.has_fired && self.running {
                    return Err(invalid("a fired one-shot timer cannot be running"));
                }
                if self.tick_count > 1 {
                    return Err(invalid("a one-shot timer fires at most once"));
                }
            }
        }

        if let Some(last) = self.virtual_last_fire {
            if last > self.virtual_next_due {
                return Err(invalid("last fire is after the next due instant"));
            }
        }

        if let Some(remaining) = self.remaining {
            if remaining > self.interval {
                return Err(invalid("remaining interval exceeds the full interval"));
            }
        }

        // A live timer holds a remaining interval exactly while it is frozen.
        if self.running && !self.has_fired {
            let frozen = self.paused || self.own_speed == 0.0;
            if frozen && self.remaining.is_none() {
                return Err(invalid("a paused or zero-speed timer must hold its remaining interval"));
            }
            if !frozen && self.remaining.is_some() {
                return Err(invalid("a counting timer cannot hold a remaining interval"));
            }
        }

        Ok(())
    }
}
