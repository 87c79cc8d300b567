//! Timer entry state machine.
//!
//! Periodic: `Running ⇄ Paused → Stopped`.
//! One-shot: `Running → Fired | Stopped`.
//!
//! Deadlines are kept in controller virtual time. A span of `d` in the
//! timer's own time covers `d / own_speed` of controller time, so changing
//! the own speed re-expresses the outstanding part of the interval at the
//! new rate without losing progress.
//!
//! Stepping a paused timer can move its own timeline ahead of the
//! controller. Its origin is then its last fire rather than `now`.

use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};

use crate::clock::validate_speed;
use crate::error::{StateError, TemporaResult, ValidationError};
use crate::time::{divide_nanos_ceil, duration_nanos, scale_nanos, VirtualInstant};

use super::state::{CallbackToken, TimerId, TimerKind, TimerState};

/// Write side of a timer's single-slot firing channel.
#[derive(Debug, Clone)]
pub(crate) enum FireSink {
    Periodic(Sender<VirtualInstant>),
    OneShot(Sender<()>),
}

impl FireSink {
    /// Pushes without blocking. A full or abandoned slot drops the value.
    fn offer(&self, at: VirtualInstant) -> bool {
        let result = match self {
            Self::Periodic(tx) => tx.try_send(at).map_err(|e| matches!(e, TrySendError::Full(_))),
            Self::OneShot(tx) => tx.try_send(()).map_err(|e| matches!(e, TrySendError::Full(_))),
        };
        match result {
            Ok(()) => true,
            Err(full) => {
                tracing::trace!(full, "fire dropped: consumer slot unavailable");
                false
            }
        }
    }
}

/// Outcome of one fire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Fire {
    pub id: TimerId,
    pub at: VirtualInstant,
    pub delivered: bool,
    pub callback: Option<CallbackToken>,
    /// The fire ended the timer's life (one-shot).
    pub finished: bool,
}

#[derive(Debug)]
pub(crate) struct TimerEntry {
    state: TimerState,
    sink: FireSink,
    /// A handle, or a receiver waiting to be reattached, can still observe the entry.
    attached: bool,
}

impl TimerEntry {
    pub fn periodic(id: TimerId, interval: Duration, now: VirtualInstant, tx: Sender<VirtualInstant>) -> Self {
        Self {
            state: TimerState {
                id,
                kind: TimerKind::Periodic,
                interval,
                own_speed: 1.0,
                virtual_last_fire: None,
                virtual_next_due: now + interval,
                remaining: None,
                tick_count: 0,
                running: true,
                paused: false,
                has_fired: false,
                callback_token: None,
            },
            sink: FireSink::Periodic(tx),
            attached: true,
        }
    }

    pub fn one_shot(
        id: TimerId,
        delay: Duration,
        token: CallbackToken,
        now: VirtualInstant,
        tx: Sender<()>,
    ) -> Self {
        Self {
            state: TimerState {
                id,
                kind: TimerKind::OneShot,
                interval: delay,
                own_speed: 1.0,
                virtual_last_fire: None,
                virtual_next_due: now + delay,
                remaining: None,
                tick_count: 0,
                running: true,
                paused: false,
                has_fired: false,
                callback_token: Some(token),
            },
            sink: FireSink::OneShot(tx),
            attached: true,
        }
    }

    /// Rebuilds an entry around a previously captured state.
    pub fn from_state(state: TimerState, sink: FireSink) -> Self {
        Self {
            state,
            sink,
            attached: true,
        }
    }

    pub fn id(&self) -> TimerId {
        self.state.id
    }

    pub fn kind(&self) -> TimerKind {
        self.state.kind
    }

    pub fn state(&self) -> &TimerState {
        &self.state
    }

    pub fn is_schedulable(&self) -> bool {
        self.state.is_schedulable()
    }

    pub fn next_due(&self) -> VirtualInstant {
        self.state.virtual_next_due
    }

    /// Stopped, or a one-shot that has fired. Nothing can revive it but a restore.
    pub fn is_finished(&self) -> bool {
        self.state.has_fired || !self.state.running
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Records that the last handle observing this entry is gone.
    pub fn release_handle(&mut self) {
        self.attached = false;
    }

    fn ensure_live(&self) -> Result<(), StateError> {
        if self.state.has_fired {
            return Err(StateError::TimerFired { id: self.state.id });
        }
        if !self.state.running {
            return Err(StateError::TimerStopped { id: self.state.id });
        }
        Ok(())
    }

    /// Controller-time span of an own-time duration. Never zero, so periodic
    /// catch-up always makes progress.
    fn span(&self, own: Duration) -> u64 {
        debug_assert!(self.state.own_speed > 0.0);
        divide_nanos_ceil(duration_nanos(own), self.state.own_speed).max(1)
    }

    fn counting(&self) -> bool {
        self.state.remaining.is_none() && !self.state.paused && self.state.own_speed > 0.0
    }

    /// Point the timer's own timeline counts from.
    fn origin(&self, now: VirtualInstant) -> VirtualInstant {
        self.state.virtual_last_fire.map_or(now, |last| last.max(now))
    }

    /// Captures the outstanding own-time interval so it stops eroding.
    fn freeze(&mut self, now: VirtualInstant) {
        if !self.counting() {
            return;
        }
        let left = duration_nanos(self.state.virtual_next_due - self.origin(now));
        let own_left = Duration::from_nanos(scale_nanos(left, self.state.own_speed));
        self.state.remaining = Some(own_left.min(self.state.interval));
    }

    /// Turns a captured interval back into a deadline, if the timer is counting again.
    fn thaw(&mut self, now: VirtualInstant) {
        if self.state.paused || self.state.own_speed <= 0.0 {
            return;
        }
        if let Some(remaining) = self.state.remaining.take() {
            let origin = self.origin(now);
            self.state.virtual_next_due = origin.saturating_add_nanos(self.span(remaining));
        }
    }

    /// Starts a full interval at the timer's origin.
    fn rearm(&mut self, now: VirtualInstant) {
        let origin = self.origin(now);
        if self.state.paused || self.state.own_speed <= 0.0 {
            self.state.remaining = Some(self.state.interval);
            self.state.virtual_next_due = origin;
        } else {
            self.state.remaining = None;
            self.state.virtual_next_due = origin.saturating_add_nanos(self.span(self.state.interval));
        }
    }

    pub fn set_speed(&mut self, speed: f64, now: VirtualInstant) -> TemporaResult<()> {
        let speed = validate_speed(speed)?;
        self.ensure_live()?;
        self.freeze(now);
        self.state.own_speed = speed;
        self.thaw(now);
        Ok(())
    }

    pub fn pause(&mut self, now: VirtualInstant) -> Result<(), StateError> {
        self.ensure_live()?;
        if self.state.paused {
            return Ok(());
        }
        self.freeze(now);
        self.state.paused = true;
        Ok(())
    }

    pub fn resume(&mut self, now: VirtualInstant) -> Result<(), StateError> {
        self.ensure_live()?;
        if !self.state.paused {
            return Ok(());
        }
        self.state.paused = false;
        self.thaw(now);
        Ok(())
    }

    /// Fires a schedulable entry whose deadline has been reached.
    pub fn fire(&mut self, now: VirtualInstant) -> Fire {
        debug_assert!(self.is_schedulable() && self.state.virtual_next_due <= now);
        let at = self.state.virtual_next_due;
        let fire = self.emit(at);

        if self.state.kind == TimerKind::Periodic {
            let span = self.span(self.state.interval);
            let mut next = at.saturating_add_nanos(span);
            if next <= now {
                // Skip whole periods that elapsed while the scheduler was away.
                let behind = now.as_nanos() - next.as_nanos();
                next = next.saturating_add_nanos((behind / span + 1).saturating_mul(span));
            }
            assert!(
                next > now || next.as_nanos() == u64::MAX,
                "periodic timer {} rescheduled at {next} which is not after {now}",
                self.state.id
            );
            self.state.virtual_next_due = next;
        }

        fire
    }

    /// Forces one fire of a paused entry by jumping its own timeline to the
    /// next due point. The fire is stamped with that point and the following
    /// period starts there, so the timer keeps its phase.
    ///
    /// At own speed zero the due point never arrives; the fire is stamped at
    /// the timer's origin.
    pub fn step(&mut self, now: VirtualInstant, globally_paused: bool) -> Result<Fire, StateError> {
        self.ensure_live()?;
        if !self.state.paused && !globally_paused {
            return Err(StateError::TimerNotPaused { id: self.state.id });
        }

        let origin = self.origin(now);
        let at = match self.state.remaining {
            Some(_) if self.state.own_speed <= 0.0 => origin,
            Some(remaining) => origin.saturating_add_nanos(self.span(remaining)),
            None => self.state.virtual_next_due.max(origin),
        };
        let fire = self.emit(at);

        if self.state.kind == TimerKind::Periodic {
            self.rearm(at);
        }
        Ok(fire)
    }

    fn emit(&mut self, at: VirtualInstant) -> Fire {
        let delivered = self.sink.offer(at);
        self.state.tick_count += 1;
        self.state.virtual_last_fire = Some(at);

        let callback = match self.state.kind {
            TimerKind::Periodic => None,
            TimerKind::OneShot => {
                self.state.has_fired = true;
                self.state.running = false;
                self.state.remaining = None;
                self.state.virtual_next_due = self.state.virtual_next_due.max(at);
                self.state.callback_token.clone()
            }
        };

        Fire {
            id: self.state.id,
            at,
            delivered,
            callback,
            finished: self.is_finished(),
        }
    }

    /// Stops the entry. Returns whether it was still active.
    pub fn stop(&mut self) -> bool {
        if self.ensure_live().is_err() {
            return false;
        }
        self.state.running = false;
        true
    }

    /// Re-arms with a new interval starting at the timer's origin.
    pub fn reset(&mut self, interval: Duration, now: VirtualInstant) -> TemporaResult<()> {
        self.ensure_live()?;
        if self.state.kind == TimerKind::Periodic && interval.is_zero() {
            return Err(ValidationError::ZeroInterval {
                field: "interval".to_string(),
            }
            .into());
        }
        self.state.interval = interval;
        self.rearm(now);
        Ok(())
    }

    /// Installs a caller-supplied state value, keeping this entry's id.
    pub fn restore_state(&mut self, state: &TimerState) -> TemporaResult<()> {
        self.ensure_live()?;
        if state.kind != self.state.kind {
            return Err(StateError::KindMismatch {
                id: self.state.id,
                expected: self.state.kind,
                actual: state.kind,
            }
            .into());
        }
        state.validate()?;

        let id = self.state.id;
        self.state = state.clone();
        self.state.id = id;
        Ok(())
    }

    /// Overwrites the whole state. Used by snapshot restore after validation.
    pub fn install(&mut self, state: TimerState) {
        debug_assert_eq!(state.id, self.state.id);
        debug_assert_eq!(state.kind, self.state.kind);
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerStatus;
    use crossbeam_channel::{bounded, Receiver};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn at(v: u64) -> VirtualInstant {
        VirtualInstant::ZERO + ms(v)
    }

    fn ticker(interval: u64) -> (TimerEntry, Receiver<VirtualInstant>) {
        let (tx, rx) = bounded(1);
        (TimerEntry::periodic(TimerId::from_raw(1), ms(interval), at(0), tx), rx)
    }

    #[test]
    fn test_periodic_fire_advances_bookkeeping() {
        let (mut entry, rx) = ticker(10);
        assert_eq!(entry.next_due(), at(10));

        let fire = entry.fire(at(10));
        assert!(fire.delivered);
        assert_eq!(fire.at, at(10));
        assert_eq!(rx.try_recv().unwrap(), at(10));
        assert_eq!(entry.state().tick_count, 1);
        assert_eq!(entry.state().virtual_last_fire, Some(at(10)));
        assert_eq!(entry.next_due(), at(20));
    }

    #[test]
    fn test_full_channel_drops_tick_but_counts_it() {
        let (mut entry, rx) = ticker(10);
        assert!(entry.fire(at(10)).delivered);
        assert!(!entry.fire(at(20)).delivered);
        assert_eq!(entry.state().tick_count, 2);
        // The consumer sees the first value only.
        assert_eq!(rx.try_recv().unwrap(), at(10));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_catch_up_skips_missed_periods() {
        let (mut entry, _rx) = ticker(10);
        entry.fire(at(75));
        assert_eq!(entry.state().tick_count, 1);
        assert_eq!(entry.next_due(), at(80));
    }

    #[test]
    fn test_pause_preserves_remaining_interval() {
        let (mut entry, _rx) = ticker(10);
        entry.pause(at(4)).unwrap();
        assert_eq!(entry.state().remaining, Some(ms(6)));
        assert_eq!(entry.state().status(), TimerStatus::Paused);
        assert!(!entry.is_schedulable());

        entry.resume(at(100)).unwrap();
        assert_eq!(entry.next_due(), at(106));
        assert_eq!(entry.state().remaining, None);
    }

    #[test]
    fn test_speed_change_rescales_outstanding_interval() {
        let (mut entry, _rx) = ticker(10);
        entry.set_speed(2.0, at(4)).unwrap();
        // 6ms of own time left, covered at 2x.
        assert_eq!(entry.next_due(), at(7));

        entry.fire(at(7));
        assert_eq!(entry.next_due(), at(12));
    }

    #[test]
    fn test_zero_speed_holds_the_timer() {
        let (mut entry, _rx) = ticker(10);
        entry.set_speed(0.0, at(2)).unwrap();
        assert!(!entry.is_schedulable());
        assert_eq!(entry.state().remaining, Some(ms(8)));

        entry.set_speed(4.0, at(50)).unwrap();
        assert_eq!(entry.next_due(), at(52));
    }

    #[test]
    fn test_negative_speed_rejected() {
        let (mut entry, _rx) = ticker(10);
        let err = entry.set_speed(-0.5, at(0)).unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(entry.state().own_speed, 1.0);
    }

    #[test]
    fn test_step_requires_pause() {
        let (mut entry, rx) = ticker(10);
        assert_eq!(
            entry.step(at(1), false),
            Err(StateError::TimerNotPaused { id: TimerId::from_raw(1) })
        );

        entry.pause(at(1)).unwrap();
        let fire = entry.step(at(1), false).unwrap();
        assert_eq!(fire.at, at(10));
        assert_eq!(rx.try_recv().unwrap(), at(10));
        assert_eq!(entry.state().tick_count, 1);
        assert_eq!(entry.state().remaining, Some(ms(10)));
        assert!(entry.state().validate().is_ok());

        // Still paused: the next step lands one full period later.
        assert_eq!(entry.step(at(1), false).unwrap().at, at(20));
        entry.resume(at(1)).unwrap();
        assert_eq!(entry.next_due(), at(30));
        assert!(entry.state().validate().is_ok());
    }

    #[test]
    fn test_step_under_global_pause_keeps_phase() {
        let (mut entry, _rx) = ticker(10);
        let fire = entry.step(at(3), true).unwrap();
        assert_eq!(fire.at, at(10));
        assert_eq!(entry.state().virtual_last_fire, Some(at(10)));
        assert_eq!(entry.next_due(), at(20));
        assert_eq!(entry.state().remaining, None);
    }

    #[test]
    fn test_step_scales_remaining_by_own_speed() {
        let (mut entry, _rx) = ticker(10);
        entry.set_speed(2.0, at(0)).unwrap();
        entry.pause(at(1)).unwrap();
        // 8ms of own time left, covered at 2x.
        assert_eq!(entry.state().remaining, Some(ms(8)));
        assert_eq!(entry.step(at(1), false).unwrap().at, at(5));

        entry.set_speed(0.0, at(1)).unwrap();
        assert_eq!(entry.step(at(1), false).unwrap().at, at(5));
    }

    #[test]
    fn test_one_shot_fires_once() {
        let (tx, rx) = bounded(1);
        let token = CallbackToken::new("burst").unwrap();
        let mut entry = TimerEntry::one_shot(TimerId::from_raw(2), ms(5), token.clone(), at(0), tx);

        let fire = entry.fire(at(5));
        assert_eq!(fire.callback, Some(token));
        assert!(rx.try_recv().is_ok());
        assert_eq!(entry.state().status(), TimerStatus::Fired);
        assert!(!entry.is_schedulable());

        assert_eq!(entry.pause(at(6)), Err(StateError::TimerFired { id: TimerId::from_raw(2) }));
        assert!(!entry.stop());
    }

    #[test]
    fn test_stopped_entry_rejects_mutation() {
        let (mut entry, _rx) = ticker(10);
        assert!(entry.stop());
        assert!(!entry.stop());
        assert_eq!(entry.resume(at(1)), Err(StateError::TimerStopped { id: TimerId::from_raw(1) }));
        assert!(entry.reset(ms(5), at(1)).unwrap_err().is_invalid_state());
    }

    #[test]
    fn test_reset_rearms_from_now() {
        let (mut entry, _rx) = ticker(10);
        entry.reset(ms(25), at(4)).unwrap();
        assert_eq!(entry.next_due(), at(29));
        assert!(entry.reset(Duration::ZERO, at(4)).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_state_round_trip_is_identity() {
        let (mut entry, _rx) = ticker(10);
        entry.fire(at(10));
        entry.set_speed(3.0, at(12)).unwrap();
        entry.pause(at(13)).unwrap();

        let before = entry.state().clone();
        entry.restore_state(&before).unwrap();
        assert_eq!(entry.state(), &before);
    }

    #[test]
    fn test_restore_state_rejects_other_kind() {
        let (mut entry, _rx) = ticker(10);
        let (tx, _orx) = bounded(1);
        let other = TimerEntry::one_shot(TimerId::from_raw(9), ms(1), CallbackToken::generate(), at(0), tx);

        let err = entry.restore_state(other.state()).unwrap_err();
        assert!(err.is_invalid_state());
    }
}
