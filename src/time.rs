//! Time primitives shared by the clock, timers and scheduler.
//!
//! Tempora keeps two notions of time apart:
//! - **Wall time**: monotonic host time, read through a [`WallClock`].
//! - **Virtual time**: the engine's own timeline, a [`VirtualInstant`]
//!   derived from wall time by the virtual clock's speed and pause state.

use std::fmt;
use std::ops::Sub;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A point on the virtual timeline, in nanoseconds since the virtual epoch.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tempora::VirtualInstant;
///
/// let t = VirtualInstant::ZERO + Duration::from_millis(5);
/// assert_eq!(t.as_nanos(), 5_000_000);
/// assert_eq!(t - VirtualInstant::ZERO, Duration::from_millis(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualInstant(u64);

impl VirtualInstant {
    /// The virtual epoch.
    pub const ZERO: Self = Self(0);

    /// Creates an instant from nanoseconds since the virtual epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Nanoseconds since the virtual epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Offset from the virtual epoch as a `Duration`.
    #[must_use]
    pub const fn since_epoch(self) -> Duration {
        Duration::from_nanos(self.0)
    }

    /// Adds a raw nanosecond delta, saturating at the end of the timeline.
    #[must_use]
    pub const fn saturating_add_nanos(self, nanos: u64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Elapsed virtual time since `earlier`, zero if `earlier` is later.
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl std::ops::Add<Duration> for VirtualInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.saturating_add_nanos(duration_nanos(rhs))
    }
}

impl std::ops::AddAssign<Duration> for VirtualInstant {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for VirtualInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

impl fmt::Display for VirtualInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v+{:?}", self.since_epoch())
    }
}

/// Source of monotonic wall time.
///
/// `now` returns the time elapsed since the clock's own origin. The scheduler
/// only ever compares readings from the same clock, so the origin is arbitrary.
pub trait WallClock: Send + Sync + fmt::Debug {
    /// Current wall time since this clock's origin.
    fn now(&self) -> Duration;
}

/// Wall clock backed by `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct SystemWallClock {
    origin: Instant,
}

impl SystemWallClock {
    /// Creates a clock whose origin is the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemWallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for SystemWallClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven wall clock for deterministic tests.
///
/// Time only moves when [`ManualWallClock::advance`] or
/// [`ManualWallClock::set`] is called.
#[derive(Debug, Default)]
pub struct ManualWallClock {
    now: Mutex<Duration>,
}

impl ManualWallClock {
    /// Creates a manual clock reading zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.saturating_add(delta);
    }

    /// Sets the clock reading. Readings never move backwards.
    pub fn set(&self, at: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = (*now).max(at);
    }
}

impl WallClock for ManualWallClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whole nanoseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Scales a nanosecond count by a non-negative factor, rounding to nearest.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn scale_nanos(nanos: u64, factor: f64) -> u64 {
    if nanos == 0 || factor <= 0.0 {
        return 0;
    }
    let scaled = (nanos as f64 * factor).round();
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}

/// Divides a nanosecond count by a positive divisor, rounding up so that a
/// wait computed from it never undershoots its deadline.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn divide_nanos_ceil(nanos: u64, divisor: f64) -> u64 {
    debug_assert!(divisor > 0.0);
    if nanos == 0 {
        return 0;
    }
    let scaled = (nanos as f64 / divisor).ceil();
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}
