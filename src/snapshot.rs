//! Controller snapshots.
//!
//! A snapshot is an immutable value holding the virtual clock reading, the
//! global speed and pause flag, and a copy of every timer's state. Firing
//! channels and actions are not captured: restore re-binds them by timer id
//! and callback token.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::validate_speed;
use crate::controller::{ControllerState, DetachedReceiver};
use crate::error::{SnapshotError, TemporaResult};
use crate::time::VirtualInstant;
use crate::timer::entry::{FireSink, TimerEntry};
use crate::timer::{TimerId, TimerKind, TimerState};

/// Snapshot format understood by this version of the crate.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Unique identifier for a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    /// Create a new random snapshot id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Controller-level clock fields.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockSnapshot {
    /// Virtual time when the snapshot was taken.
    pub virtual_now: VirtualInstant,
    /// Global speed multiplier, kept while paused.
    pub speed: f64,
    /// Whether the controller was globally paused.
    pub paused: bool,
}

/// Immutable capture of a controller's full state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    id: SnapshotId,
    taken_at: DateTime<Utc>,
    format_version: u32,
    clock: ClockSnapshot,
    timers: BTreeMap<TimerId, TimerState>,
}

impl Snapshot {
    /// Identifier assigned at capture.
    #[must_use]
    pub const fn id(&self) -> SnapshotId {
        self.id
    }

    /// Wall-clock date of capture, for bookkeeping only.
    #[must_use]
    pub const fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Format version the snapshot was written with.
    #[must_use]
    pub const fn format_version(&self) -> u32 {
        self.format_version
    }

    /// Clock reading, global speed and pause flag at capture.
    #[must_use]
    pub const fn clock(&self) -> &ClockSnapshot {
        &self.clock
    }

    /// Captured timer states keyed by id.
    #[must_use]
    pub const fn timers(&self) -> &BTreeMap<TimerId, TimerState> {
        &self.timers
    }

    /// State captured for one timer.
    #[must_use]
    pub fn timer(&self, id: TimerId) -> Option<&TimerState> {
        self.timers.get(&id)
    }

    pub(crate) fn capture(state: &ControllerState, real: Duration) -> Self {
        Self {
            id: SnapshotId::new(),
            taken_at: Utc::now(),
            format_version: SNAPSHOT_FORMAT_VERSION,
            clock: ClockSnapshot {
                virtual_now: state.now_at(real),
                speed: state.global_speed,
                paused: state.global_paused,
            },
            timers: state
                .entries
                .values()
                .chain(state.retired.values())
                .map(|e| (e.id(), e.state().clone()))
                .collect(),
        }
    }

    /// Checks the snapshot's structure on its own.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: self.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }

        validate_speed(self.clock.speed).map_err(|_| SnapshotError::InvalidGlobalSpeed {
            value: self.clock.speed,
        })?;

        for (key, timer) in &self.timers {
            if *key != timer.id {
                return Err(SnapshotError::IdMismatch { key: *key, id: timer.id });
            }
            timer.validate().map_err(|e| SnapshotError::InvalidTimer {
                id: timer.id,
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    /// Checks the snapshot against the timers a controller already holds.
    pub(crate) fn check_compatible(&self, state: &ControllerState) -> Result<(), SnapshotError> {
        for (id, timer) in &self.timers {
            if let Some(existing) = state.entry(*id) {
                if existing.kind() != timer.kind {
                    return Err(SnapshotError::KindMismatch {
                        id: *id,
                        snapshot: timer.kind,
                        existing: existing.kind(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Installs the snapshot into a controller. Must follow [`Snapshot::validate`]
    /// and [`Snapshot::check_compatible`] under the same lock.
    pub(crate) fn apply(&self, state: &mut ControllerState, real: Duration) -> TemporaResult<()> {
        let clock_speed = if self.clock.paused { 0.0 } else { self.clock.speed };
        state.clock.restore_at(self.clock.virtual_now, clock_speed, real)?;
        state.global_speed = self.clock.speed;
        state.global_paused = self.clock.paused;

        for (id, timer) in &self.timers {
            if let Some(entry) = state.entry_mut(*id) {
                entry.install(timer.clone());
                state.refile(*id);
                continue;
            }

            let (sink, rx) = match timer.kind {
                TimerKind::Periodic => {
                    let (tx, rx) = bounded(1);
                    (FireSink::Periodic(tx), DetachedReceiver::Periodic(rx))
                }
                TimerKind::OneShot => {
                    let (tx, rx) = bounded(1);
                    (FireSink::OneShot(tx), DetachedReceiver::OneShot(rx))
                }
            };
            state.file(TimerEntry::from_state(timer.clone(), sink));
            state.detached.insert(*id, rx);
            state.reserve_id(*id);
        }

        state.breakpoints.move_cursor_to(self.clock.virtual_now);
        state.last_hit = None;
        Ok(())
    }

    /// Serializes the snapshot to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Decode` if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, SnapshotError> {
        serde_json::to_string_pretty(self).map_err(|e| SnapshotError::Decode {
            message: format!("serialize snapshot: {e}"),
        })
    }

    /// Deserializes and validates a snapshot from JSON.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Decode` for malformed JSON and the validation
    /// error for structurally invalid content.
    pub fn from_json(s: &str) -> Result<Self, SnapshotError> {
        let snapshot = serde_json::from_str::<Self>(s).map_err(|e| SnapshotError::Decode {
            message: format!("deserialize snapshot: {e}"),
        })?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Writes the snapshot as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Io` if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let path = path.as_ref();
        let json = self.to_json_pretty()?;
        fs::write(path, json).map_err(|e| SnapshotError::Io {
            message: format!("write {}: {e}", path.display()),
        })
    }

    /// Reads and validates a snapshot written by [`Snapshot::save`].
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Io` if the file cannot be read, otherwise the
    /// errors of [`Snapshot::from_json`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| SnapshotError::Io {
            message: format!("read {}: {e}", path.display()),
        })?;
        Self::from_json(&json)
    }
}
