//! Error types for Tempora.
//!
//! All errors are strongly typed using thiserror and fall into three
//! families: invalid arguments, invalid state transitions and malformed
//! snapshots. Every error is returned synchronously to the caller of the
//! offending operation.

use thiserror::Error;

use crate::timer::{TimerId, TimerKind};

/// Invalid arguments passed to an operation.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Speed multiplier {value} must be a finite, non-negative number")]
    InvalidSpeed {
        value: f64,
    },

    #[error("Interval for '{field}' must be greater than zero")]
    ZeroInterval {
        field: String,
    },

    #[error("Timer state is invalid: {reason}")]
    InvalidTimerState {
        reason: String,
    },

    #[error("No action is registered for callback token '{token}'")]
    UnknownCallback {
        token: String,
    },

    #[error("Callback token cannot be empty")]
    EmptyCallbackToken,
}

/// Operations attempted in a state that does not permit them.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StateError {
    #[error("Timer not found: {id}")]
    UnknownTimer {
        id: TimerId,
    },

    #[error("Timer {id} is stopped")]
    TimerStopped {
        id: TimerId,
    },

    #[error("Timer {id} has already fired")]
    TimerFired {
        id: TimerId,
    },

    #[error("Timer {id} can only be stepped while paused")]
    TimerNotPaused {
        id: TimerId,
    },

    #[error("Controller must be globally paused to step")]
    ControllerNotPaused,

    #[error("Controller is closed")]
    ControllerClosed,

    #[error("State for a {actual:?} timer cannot be installed into {id} ({expected:?})")]
    KindMismatch {
        id: TimerId,
        expected: TimerKind,
        actual: TimerKind,
    },

    #[error("Timer {id} was already reattached")]
    AlreadyAttached {
        id: TimerId,
    },
}

/// Structural problems found while validating a snapshot.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("Unsupported snapshot format version {found} (supported: {supported})")]
    UnsupportedVersion {
        found: u32,
        supported: u32,
    },

    #[error("Snapshot global speed {value} is not a finite, non-negative number")]
    InvalidGlobalSpeed {
        value: f64,
    },

    #[error("Snapshot key {key} holds the state of timer {id}")]
    IdMismatch {
        key: TimerId,
        id: TimerId,
    },

    #[error("Snapshot timer {id} is malformed: {reason}")]
    InvalidTimer {
        id: TimerId,
        reason: String,
    },

    #[error("Snapshot timer {id} is {snapshot:?} but the controller holds a {existing:?} timer")]
    KindMismatch {
        id: TimerId,
        snapshot: TimerKind,
        existing: TimerKind,
    },

    #[error("Failed to decode snapshot: {message}")]
    Decode {
        message: String,
    },

    #[error("Snapshot I/O failed: {message}")]
    Io {
        message: String,
    },
}

/// Top-level error type for Tempora.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TemporaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ValidationError),

    #[error("Invalid state: {0}")]
    InvalidState(#[from] StateError),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(#[from] SnapshotError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl TemporaError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is an invalid argument error.
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }

    /// Returns true if this is an invalid state error.
    #[must_use]
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }

    /// Returns true if this is an invalid snapshot error.
    #[must_use]
    pub const fn is_invalid_snapshot(&self) -> bool {
        matches!(self, Self::InvalidSnapshot(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for Tempora operations.
pub type TemporaResult<T> = Result<T, TemporaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_speed() {
        let err = ValidationError::InvalidSpeed { value: -2.0 };
        let msg = format!("{err}");
        assert!(msg.contains("-2"));
        assert!(msg.contains("non-negative"));
    }

    #[test]
    fn test_state_error_kind_mismatch() {
        let err = StateError::KindMismatch {
            id: TimerId::from_raw(3),
            expected: TimerKind::Periodic,
            actual: TimerKind::OneShot,
        };
        let msg = format!("{err}");
        assert!(msg.contains("t3"));
        assert!(msg.contains("OneShot"));
    }

    #[test]
    fn test_snapshot_error_version() {
        let err = SnapshotError::UnsupportedVersion { found: 9, supported: 1 };
        let msg = format!("{err}");
        assert!(msg.contains('9'));
        assert!(msg.contains("supported: 1"));
    }

    #[test]
    fn test_tempora_error_from_validation() {
        let err: TemporaError = ValidationError::EmptyCallbackToken.into();
        assert!(err.is_invalid_argument());
        assert!(!err.is_invalid_state());
    }

    #[test]
    fn test_tempora_error_from_state() {
        let err: TemporaError = StateError::ControllerNotPaused.into();
        assert!(err.is_invalid_state());
        assert!(format!("{err}").contains("globally paused"));
    }

    #[test]
    fn test_tempora_error_from_snapshot() {
        let err: TemporaError = SnapshotError::InvalidGlobalSpeed { value: f64::NAN }.into();
        assert!(err.is_invalid_snapshot());
    }

    #[test]
    fn test_tempora_error_internal() {
        let err = TemporaError::internal("worker spawn failed");
        assert!(err.is_internal());
        assert!(format!("{err}").contains("worker spawn failed"));
    }
}
