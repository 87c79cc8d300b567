//! Caller-side timer handles.
//!
//! A handle pairs the receiving end of a timer's firing channel with a
//! reference to the controller that owns the timer. The timer itself lives
//! in the controller; every operation on a handle goes through the
//! controller-wide lock and wakes the scheduler.
//!
//! Capabilities are split in two traits: [`StandardTimer`] is the minimal
//! channel/stop/reset contract of an ordinary timer, [`TemporalTimer`] adds
//! virtual-time control.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::controller::Shared;
use crate::error::{StateError, TemporaResult};
use crate::scheduler;
use crate::time::VirtualInstant;
use crate::timer::entry::TimerEntry;

use super::state::{TimerId, TimerState, TimerStatus};

/// Minimal contract shared with ordinary timers.
pub trait StandardTimer {
    /// Value delivered on each fire.
    type Tick;

    /// Single-slot firing channel. A fire that finds the slot full is dropped.
    fn channel(&self) -> &Receiver<Self::Tick>;

    /// Stops the timer. Returns whether it was still active.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ControllerClosed` after the controller is closed.
    fn stop(&self) -> TemporaResult<bool>;

    /// Re-arms the timer with a new interval starting now, or at its last
    /// fire if a step moved the timer ahead of the controller.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimerStopped` / `StateError::TimerFired` for
    /// inactive timers and `ValidationError::ZeroInterval` for a zero period.
    fn reset(&self, interval: Duration) -> TemporaResult<()>;
}

/// Virtual-time control of a single timer.
pub trait TemporalTimer {
    /// Stable id, preserved across snapshot restore.
    fn id(&self) -> TimerId;

    /// Sets the timer's own speed multiplier, composed with the global speed.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidSpeed` for negative or non-finite
    /// values and `StateError` for inactive timers.
    fn set_speed(&self, speed: f64) -> TemporaResult<()>;

    /// Own speed multiplier.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownTimer` if the controller lost the timer.
    fn speed(&self) -> TemporaResult<f64>;

    /// Pauses the timer, keeping the rest of its interval. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `StateError` for stopped or fired timers.
    fn pause(&self) -> TemporaResult<()>;

    /// Resumes the timer with the interval left at pause. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `StateError` for stopped or fired timers.
    fn resume(&self) -> TemporaResult<()>;

    /// Forces one fire and returns the virtual instant it was stamped with.
    ///
    /// The timer jumps to its next due point: the fire carries that instant
    /// and the following period starts from it, so the phase is kept. The
    /// controller's clock does not move. Only allowed while the timer or the
    /// whole controller is paused.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimerNotPaused` if neither is paused.
    fn step(&self) -> TemporaResult<VirtualInstant>;

    /// Value copy of the timer's bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownTimer` if the controller lost the timer.
    fn state(&self) -> TemporaResult<TimerState>;

    /// Installs a state value previously obtained from [`TemporalTimer::state`].
    ///
    /// # Errors
    ///
    /// Returns `StateError::KindMismatch` for a state of the other kind and
    /// `ValidationError` for a structurally invalid state.
    fn restore_state(&self, state: &TimerState) -> TemporaResult<()>;

    /// Number of fires so far, dropped deliveries included.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownTimer` if the controller lost the timer.
    fn tick_count(&self) -> TemporaResult<u64>;

    /// Lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownTimer` if the controller lost the timer.
    fn status(&self) -> TemporaResult<TimerStatus>;
}

#[derive(Debug)]
struct TimerCore {
    id: TimerId,
    shared: Arc<Shared>,
}

impl TimerCore {
    fn mutate<T, F>(&self, op: F) -> TemporaResult<T>
    where
        F: FnOnce(&mut TimerEntry, VirtualInstant) -> TemporaResult<T>,
    {
        let (out, released) = {
            let mut state = self.shared.open_state()?;
            let now = state.now_at(self.shared.real_now());
            let entry = state
                .entry_mut(self.id)
                .ok_or(StateError::UnknownTimer { id: self.id })?;
            let out = op(entry, now)?;
            state.refile(self.id);
            (out, state.take_released())
        };
        drop(released);
        self.shared.wake();
        Ok(out)
    }

    fn inspect<T, F>(&self, op: F) -> TemporaResult<T>
    where
        F: FnOnce(&TimerEntry) -> T,
    {
        let state = self.shared.state();
        state
            .entry(self.id)
            .map(op)
            .ok_or_else(|| StateError::UnknownTimer { id: self.id }.into())
    }

    fn step(&self) -> TemporaResult<VirtualInstant> {
        let (at, mut cycle) = {
            let mut state = self.shared.open_state()?;
            let real = self.shared.real_now();
            let now = state.now_at(real);
            let globally_paused = state.global_paused;
            let entry = state
                .entry_mut(self.id)
                .ok_or(StateError::UnknownTimer { id: self.id })?;
            let fire = entry.step(now, globally_paused)?;
            let at = fire.at;
            (at, scheduler::settle(&mut state, vec![fire], now, real))
        };
        self.shared.wake();
        cycle.run_actions();
        Ok(at)
    }
}

impl Drop for TimerCore {
    fn drop(&mut self) {
        self.shared.state().release_handle(self.id);
    }
}

macro_rules! impl_timer_capabilities {
    ($handle:ty, $tick:ty) => {
        impl StandardTimer for $handle {
            type Tick = $tick;

            fn channel(&self) -> &Receiver<$tick> {
                &self.rx
            }

            fn stop(&self) -> TemporaResult<bool> {
                let stopped = self.core.mutate(|entry, _| Ok(entry.stop()))?;
                if stopped {
                    tracing::debug!(timer = %self.core.id, "timer stopped");
                }
                Ok(stopped)
            }

            fn reset(&self, interval: Duration) -> TemporaResult<()> {
                self.core.mutate(|entry, now| entry.reset(interval, now))
            }
        }

        impl TemporalTimer for $handle {
            fn id(&self) -> TimerId {
                self.core.id
            }

            fn set_speed(&self, speed: f64) -> TemporaResult<()> {
                self.core.mutate(|entry, now| entry.set_speed(speed, now))?;
                tracing::debug!(timer = %self.core.id, speed, "timer speed changed");
                Ok(())
            }

            fn speed(&self) -> TemporaResult<f64> {
                self.core.inspect(|entry| entry.state().own_speed)
            }

            fn pause(&self) -> TemporaResult<()> {
                self.core.mutate(|entry, now| Ok(entry.pause(now)?))
            }

            fn resume(&self) -> TemporaResult<()> {
                self.core.mutate(|entry, now| Ok(entry.resume(now)?))
            }

            fn step(&self) -> TemporaResult<VirtualInstant> {
                self.core.step()
            }

            fn state(&self) -> TemporaResult<TimerState> {
                self.core.inspect(|entry| entry.state().clone())
            }

            fn restore_state(&self, state: &TimerState) -> TemporaResult<()> {
                self.core.mutate(|entry, _| entry.restore_state(state))
            }

            fn tick_count(&self) -> TemporaResult<u64> {
                self.core.inspect(|entry| entry.state().tick_count)
            }

            fn status(&self) -> TemporaResult<TimerStatus> {
                self.core.inspect(|entry| entry.state().status())
            }
        }
    };
}

/// Handle to a periodic timer. Each fire delivers its virtual due instant.
///
/// Dropping the handle does not stop the timer; call
/// [`StandardTimer::stop`] for that. Once the timer is stopped and its
/// handle dropped, the controller forgets it.
#[derive(Debug)]
pub struct Ticker {
    core: TimerCore,
    rx: Receiver<VirtualInstant>,
}

impl Ticker {
    pub(crate) fn new(id: TimerId, rx: Receiver<VirtualInstant>, shared: Arc<Shared>) -> Self {
        Self {
            core: TimerCore { id, shared },
            rx,
        }
    }

    /// Blocks until the next delivered tick. Returns `None` once the
    /// controller that owns the timer is gone.
    #[must_use]
    pub fn recv(&self) -> Option<VirtualInstant> {
        self.rx.recv().ok()
    }

    /// Waits up to `timeout` of wall time for a tick.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<VirtualInstant> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Takes a pending tick without blocking.
    #[must_use]
    pub fn try_recv(&self) -> Option<VirtualInstant> {
        self.rx.try_recv().ok()
    }
}

impl_timer_capabilities!(Ticker, VirtualInstant);

/// Handle to a one-shot timer. The fire signal carries no payload; the
/// timer's work is the action bound to its callback token.
///
/// Dropping the handle does not cancel the timer. Once it has fired or been
/// stopped and the handle is gone, the controller forgets it.
#[derive(Debug)]
pub struct Timer {
    core: TimerCore,
    rx: Receiver<()>,
}

impl Timer {
    pub(crate) fn new(id: TimerId, rx: Receiver<()>, shared: Arc<Shared>) -> Self {
        Self {
            core: TimerCore { id, shared },
            rx,
        }
    }

    /// Waits up to `timeout` of wall time for the fire signal.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// True if the fire signal is pending; consumes it.
    #[must_use]
    pub fn try_fired(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

impl_timer_capabilities!(Timer, ());
