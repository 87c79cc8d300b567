//! Virtual clock: maps wall time onto virtual time.
//!
//! The clock is a pure anchor/speed pair. At any wall instant `t` at or
//! after the real anchor:
//!
//! ```text
//! virtual(t) = virtual_anchor + (t - real_anchor) * speed
//! ```
//!
//! Every mutation first freezes the current virtual time into a new anchor
//! pair, so a speed change never rewrites the past.

use std::time::Duration;

use crate::error::ValidationError;
use crate::time::{divide_nanos_ceil, duration_nanos, scale_nanos, VirtualInstant};

/// Checks that `speed` is a finite, non-negative multiplier.
///
/// # Errors
///
/// Returns `ValidationError::InvalidSpeed` for negative, NaN or infinite values.
pub fn validate_speed(speed: f64) -> Result<f64, ValidationError> {
    if speed.is_finite() && speed >= 0.0 {
        Ok(speed)
    } else {
        Err(ValidationError::InvalidSpeed { value: speed })
    }
}

/// Anchor/speed mapping from wall time to virtual time.
///
/// All operations take the wall instant explicitly. Callers read it once
/// from their [`WallClock`](crate::WallClock) and pass it through, which keeps
/// a batch of mutations consistent with a single reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirtualClock {
    real_anchor: Duration,
    virtual_anchor: VirtualInstant,
    speed: f64,
}

impl VirtualClock {
    /// Creates a clock reading `start` at wall instant `real`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidSpeed` if `speed` is negative or not finite.
    pub fn new(real: Duration, start: VirtualInstant, speed: f64) -> Result<Self, ValidationError> {
        Ok(Self {
            real_anchor: real,
            virtual_anchor: start,
            speed: validate_speed(speed)?,
        })
    }

    /// Current speed multiplier. Zero means paused.
    #[must_use]
    pub const fn speed(&self) -> f64 {
        self.speed
    }

    /// True while the speed is zero.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.speed == 0.0
    }

    /// Wall instant of the current anchor.
    #[must_use]
    pub const fn real_anchor(&self) -> Duration {
        self.real_anchor
    }

    /// Virtual reading at the current anchor.
    #[must_use]
    pub const fn virtual_anchor(&self) -> VirtualInstant {
        self.virtual_anchor
    }

    /// Virtual time at wall instant `real`.
    ///
    /// Readings before the real anchor return the anchor itself.
    #[must_use]
    pub fn now_at(&self, real: Duration) -> VirtualInstant {
        let elapsed = duration_nanos(real.saturating_sub(self.real_anchor));
        self.virtual_anchor
            .saturating_add_nanos(scale_nanos(elapsed, self.speed))
    }

    fn reanchor(&mut self, real: Duration) {
        self.virtual_anchor = self.now_at(real);
        self.real_anchor = self.real_anchor.max(real);
    }

    /// Re-anchors at `real` and switches to `speed`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidSpeed` if `speed` is negative or not
    /// finite. The clock is left untouched in that case.
    pub fn set_speed_at(&mut self, speed: f64, real: Duration) -> Result<(), ValidationError> {
        let speed = validate_speed(speed)?;
        self.reanchor(real);
        self.speed = speed;
        Ok(())
    }

    /// Re-anchors at `real` and stops virtual time.
    pub fn pause_at(&mut self, real: Duration) {
        self.reanchor(real);
        self.speed = 0.0;
    }

    /// Re-anchors at `real` and jumps virtual time forward by `delta`,
    /// independent of elapsed wall time. Speed is unchanged.
    pub fn advance_virtual_at(&mut self, delta: Duration, real: Duration) {
        self.reanchor(real);
        self.virtual_anchor += delta;
    }

    /// Installs a fresh anchor pair: virtual time reads `at` from wall instant `real`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidSpeed` if `speed` is negative or not finite.
    pub fn restore_at(&mut self, at: VirtualInstant, speed: f64, real: Duration) -> Result<(), ValidationError> {
        let speed = validate_speed(speed)?;
        self.real_anchor = real;
        self.virtual_anchor = at;
        self.speed = speed;
        Ok(())
    }

    /// Wall time left until virtual time reaches `target`, measured from `real`.
    ///
    /// Returns `None` while paused, since the target is then never reached by
    /// waiting. A target already in the past yields `Some(Duration::ZERO)`.
    #[must_use]
    pub fn real_until(&self, target: VirtualInstant, real: Duration) -> Option<Duration> {
        let now = self.now_at(real);
        if target <= now {
            return Some(Duration::ZERO);
        }
        if self.is_paused() {
            return None;
        }
        let remaining = target.as_nanos() - now.as_nanos();
        Some(Duration::from_nanos(divide_nanos_ceil(remaining, self.speed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_clock_tracks_wall_time_at_unit_speed() {
        let clock = VirtualClock::new(ms(100), VirtualInstant::ZERO, 1.0).unwrap();
        assert_eq!(clock.now_at(ms(100)), VirtualInstant::ZERO);
        assert_eq!(clock.now_at(ms(150)), VirtualInstant::ZERO + ms(50));
        // Readings before the anchor clamp to the anchor.
        assert_eq!(clock.now_at(ms(10)), VirtualInstant::ZERO);
    }

    #[test]
    fn test_clock_rejects_invalid_speed() {
        assert!(VirtualClock::new(ms(0), VirtualInstant::ZERO, -1.0).is_err());
        assert!(VirtualClock::new(ms(0), VirtualInstant::ZERO, f64::NAN).is_err());

        let mut clock = VirtualClock::new(ms(0), VirtualInstant::ZERO, 2.0).unwrap();
        let before = clock;
        assert_eq!(
            clock.set_speed_at(f64::INFINITY, ms(10)),
            Err(ValidationError::InvalidSpeed { value: f64::INFINITY })
        );
        assert_eq!(clock, before);
    }

    #[test]
    fn test_speed_change_reanchors() {
        let mut clock = VirtualClock::new(ms(0), VirtualInstant::ZERO, 1.0).unwrap();
        clock.set_speed_at(4.0, ms(10)).unwrap();
        assert_eq!(clock.virtual_anchor(), VirtualInstant::ZERO + ms(10));
        assert_eq!(clock.real_anchor(), ms(10));
        // 10ms at 1x plus 5ms at 4x.
        assert_eq!(clock.now_at(ms(15)), VirtualInstant::ZERO + ms(30));
    }

    #[test]
    fn test_pause_freezes_virtual_time() {
        let mut clock = VirtualClock::new(ms(0), VirtualInstant::ZERO, 1.0).unwrap();
        clock.set_speed_at(0.0, ms(20)).unwrap();
        assert!(clock.is_paused());
        assert_eq!(clock.now_at(ms(20)), VirtualInstant::ZERO + ms(20));
        assert_eq!(clock.now_at(ms(500)), VirtualInstant::ZERO + ms(20));

        clock.set_speed_at(1.0, ms(500)).unwrap();
        assert_eq!(clock.now_at(ms(510)), VirtualInstant::ZERO + ms(30));
    }

    #[test]
    fn test_speed_changes_at_one_instant_collapse() {
        let mut sequence = VirtualClock::new(ms(0), VirtualInstant::ZERO, 1.0).unwrap();
        for speed in [3.0, 0.0, 0.25, 7.5, 2.0] {
            sequence.set_speed_at(speed, ms(40)).unwrap();
        }

        let mut single = VirtualClock::new(ms(0), VirtualInstant::ZERO, 1.0).unwrap();
        single.set_speed_at(2.0, ms(40)).unwrap();

        assert_eq!(sequence.now_at(ms(40)), single.now_at(ms(40)));
        assert_eq!(sequence.now_at(ms(90)), single.now_at(ms(90)));
    }

    #[test]
    fn test_advance_virtual_jumps_without_wall_time() {
        let mut clock = VirtualClock::new(ms(0), VirtualInstant::ZERO, 0.0).unwrap();
        clock.advance_virtual_at(ms(7), ms(3));
        assert_eq!(clock.now_at(ms(3)), VirtualInstant::ZERO + ms(7));
        assert_eq!(clock.speed(), 0.0);
    }

    #[test]
    fn test_restore_installs_anchor_pair() {
        let mut clock = VirtualClock::new(ms(0), VirtualInstant::ZERO, 1.0).unwrap();
        clock
            .restore_at(VirtualInstant::from_nanos(1_000), 2.0, ms(50))
            .unwrap();
        assert_eq!(clock.now_at(ms(50)), VirtualInstant::from_nanos(1_000));
        assert_eq!(
            clock.now_at(ms(51)),
            VirtualInstant::from_nanos(1_000) + Duration::from_millis(2)
        );
    }

    #[test]
    fn test_real_until_scales_with_speed() {
        let clock = VirtualClock::new(ms(0), VirtualInstant::ZERO, 2.0).unwrap();
        let target = VirtualInstant::ZERO + ms(10);
        assert_eq!(clock.real_until(target, ms(0)), Some(ms(5)));
        assert_eq!(clock.real_until(target, ms(5)), Some(Duration::ZERO));

        let paused = VirtualClock::new(ms(0), VirtualInstant::ZERO, 0.0).unwrap();
        assert_eq!(paused.real_until(target, ms(0)), None);
        assert_eq!(paused.real_until(VirtualInstant::ZERO, ms(0)), Some(Duration::ZERO));
    }
}
