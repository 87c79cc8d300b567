//! Temporal controller: the public entry point of the engine.
//!
//! A controller owns one virtual clock, a registry of timers, the global
//! speed and pause state, and the breakpoint list. A dedicated scheduler
//! thread fires timers against the virtual clock. All mutations happen under
//! one controller-wide lock and wake the scheduler so it re-evaluates its
//! next deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, trace};

use crate::action::{Action, ActionRegistry};
use crate::breakpoint::{Breakpoint, BreakpointCondition, BreakpointEvaluator, BreakpointHit, BreakpointId};
use crate::clock::{validate_speed, VirtualClock};
use crate::error::{StateError, TemporaError, TemporaResult, ValidationError};
use crate::scheduler;
use crate::snapshot::Snapshot;
use crate::time::{SystemWallClock, VirtualInstant, WallClock};
use crate::timer::entry::TimerEntry;
use crate::timer::{CallbackToken, Ticker, Timer, TimerId, TimerKind, TimerState};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Global speed multiplier at start. Must be finite and non-negative.
    pub initial_speed: f64,
    /// Start with virtual time paused.
    pub start_paused: bool,
    /// Name of the scheduler thread.
    pub thread_name: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            initial_speed: 1.0,
            start_paused: false,
            thread_name: "tempora-scheduler".to_string(),
        }
    }
}

/// Outcome of [`TemporalController::step_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Virtual time after the step.
    pub virtual_time: VirtualInstant,
    /// Timers fired by the step, in ascending id order.
    pub fired: Vec<TimerId>,
    /// Breakpoint matched by the step, if any.
    pub breakpoint: Option<BreakpointHit>,
}

/// Receiver created for a timer that a snapshot restore recreated, held
/// until the caller reattaches a handle.
#[derive(Debug)]
pub(crate) enum DetachedReceiver {
    Periodic(Receiver<VirtualInstant>),
    OneShot(Receiver<()>),
}

#[derive(Debug)]
pub(crate) struct ControllerState {
    pub clock: VirtualClock,
    /// Speed requested by the caller; the clock runs at zero while paused.
    pub global_speed: f64,
    pub global_paused: bool,
    /// Timers that may still fire. The scheduler only scans these.
    pub entries: BTreeMap<TimerId, TimerEntry>,
    /// Stopped or fired timers kept while a handle can still inspect them.
    pub retired: BTreeMap<TimerId, TimerEntry>,
    pub breakpoints: BreakpointEvaluator,
    pub actions: ActionRegistry,
    pub detached: HashMap<TimerId, DetachedReceiver>,
    pub last_hit: Option<BreakpointHit>,
    pub closed: bool,
    next_id: u64,
}

impl ControllerState {
    pub fn now_at(&self, real: Duration) -> VirtualInstant {
        self.clock.now_at(real)
    }

    fn allocate_id(&mut self) -> TimerId {
        self.next_id += 1;
        TimerId::from_raw(self.next_id)
    }

    /// Keeps fresh ids clear of ids brought in by a restore.
    pub fn reserve_id(&mut self, id: TimerId) {
        self.next_id = self.next_id.max(id.as_raw());
    }

    pub fn entry(&self, id: TimerId) -> Option<&TimerEntry> {
        self.entries.get(&id).or_else(|| self.retired.get(&id))
    }

    pub fn entry_mut(&mut self, id: TimerId) -> Option<&mut TimerEntry> {
        match self.entries.get_mut(&id) {
            Some(entry) => Some(entry),
            None => self.retired.get_mut(&id),
        }
    }

    /// Places an entry in the active or retired set according to its state.
    ///
    /// A finished entry gives up its owned action. It is kept for inspection
    /// only while something can still observe it.
    pub fn file(&mut self, entry: TimerEntry) {
        let id = entry.id();
        if !entry.is_finished() {
            self.entries.insert(id, entry);
            return;
        }
        if let Some(token) = &entry.state().callback_token {
            if self.actions.release(token) {
                trace!(timer = %id, token = %token, "owned action released");
            }
        }
        if entry.is_attached() {
            self.retired.insert(id, entry);
        } else {
            trace!(timer = %id, "finished timer dropped");
        }
    }

    /// Re-files an entry after a mutation that may have finished or revived it.
    pub fn refile(&mut self, id: TimerId) {
        if let Some(entry) = self.entries.remove(&id).or_else(|| self.retired.remove(&id)) {
            self.file(entry);
        }
    }

    /// Owned actions let go under the lock. Drop them after unlocking.
    pub fn take_released(&mut self) -> Vec<Action> {
        self.actions.take_released()
    }

    /// Called when the handle of `id` is dropped.
    pub fn release_handle(&mut self, id: TimerId) {
        if self.retired.remove(&id).is_some() {
            trace!(timer = %id, "retired timer released");
        } else if let Some(entry) = self.entries.get_mut(&id) {
            entry.release_handle();
        }
    }

    /// Earliest virtual instant the scheduler has to act on.
    pub fn deadline(&self) -> Option<VirtualInstant> {
        if self.global_paused {
            return None;
        }
        let timers = self
            .entries
            .values()
            .filter(|e| e.is_schedulable())
            .map(TimerEntry::next_due)
            .min();
        match (timers, self.breakpoints.next_time_condition()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Earliest due instant among timers a global step may fire.
    fn next_step_due(&self) -> Option<VirtualInstant> {
        self.entries
            .values()
            .filter(|e| e.is_schedulable())
            .map(TimerEntry::next_due)
            .min()
    }
}

/// State shared between the controller, its timer handles and the scheduler thread.
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<ControllerState>,
    wall: Arc<dyn WallClock>,
    wake_tx: Sender<()>,
}

impl Shared {
    /// Locks the state for inspection, including after close.
    pub fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the state for mutation.
    pub fn open_state(&self) -> Result<MutexGuard<'_, ControllerState>, StateError> {
        let state = self.state();
        if state.closed {
            return Err(StateError::ControllerClosed);
        }
        Ok(state)
    }

    pub fn real_now(&self) -> Duration {
        self.wall.now()
    }

    /// Interrupts the scheduler's current wait. Wakes coalesce.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }
}

/// Coordinates a set of timers on one virtual clock.
///
/// The controller is explicitly constructed and owned; there is no process
/// default. Closing it (or dropping it) stops the scheduler thread. Timer
/// handles stay inspectable after close, but every mutation then fails with
/// `StateError::ControllerClosed`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tempora::{ControllerConfig, TemporalController, TemporalTimer};
///
/// let controller = TemporalController::new(ControllerConfig::default()).unwrap();
/// let ticker = controller.new_ticker(Duration::from_millis(5)).unwrap();
///
/// controller.pause_all().unwrap();
/// let report = controller.step_all().unwrap();
/// assert_eq!(report.fired, vec![ticker.id()]);
/// ```
#[derive(Debug)]
pub struct TemporalController {
    shared: Arc<Shared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TemporalController {
    /// Creates a controller on the system monotonic clock and starts its scheduler.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidSpeed` for a bad initial speed and an
    /// internal error if the scheduler thread cannot be spawned.
    pub fn new(config: ControllerConfig) -> TemporaResult<Self> {
        Self::with_wall_clock(config, Arc::new(SystemWallClock::new()))
    }

    /// Creates a controller reading wall time from `wall`.
    ///
    /// # Errors
    ///
    /// Same as [`TemporalController::new`].
    pub fn with_wall_clock(config: ControllerConfig, wall: Arc<dyn WallClock>) -> TemporaResult<Self> {
        let speed = validate_speed(config.initial_speed)?;
        let clock_speed = if config.start_paused { 0.0 } else { speed };
        let clock = VirtualClock::new(wall.now(), VirtualInstant::ZERO, clock_speed)?;

        let (wake_tx, wake_rx) = bounded::<()>(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(ControllerState {
                clock,
                global_speed: speed,
                global_paused: config.start_paused,
                entries: BTreeMap::new(),
                retired: BTreeMap::new(),
                breakpoints: BreakpointEvaluator::default(),
                actions: ActionRegistry::default(),
                detached: HashMap::new(),
                last_hit: None,
                closed: false,
                next_id: 0,
            }),
            wall,
            wake_tx,
        });

        let join = scheduler::spawn(Arc::clone(&shared), wake_rx, config.thread_name)
            .map_err(|e| TemporaError::internal(format!("failed to spawn scheduler: {e}")))?;

        Ok(Self {
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    /// Stops the scheduler and rejects further mutations. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.shared.state();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.wake();

        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                // An action running on the scheduler thread may close the
                // controller; that thread exits on its own.
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
        }
        info!("controller closed");
    }

    /// True once [`TemporalController::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> VirtualInstant {
        let real = self.shared.real_now();
        self.shared.state().now_at(real)
    }

    /// Creates and registers a periodic timer.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::ZeroInterval` for a zero interval and
    /// `StateError::ControllerClosed` after close.
    pub fn new_ticker(&self, interval: Duration) -> TemporaResult<Ticker> {
        if interval.is_zero() {
            return Err(ValidationError::ZeroInterval {
                field: "interval".to_string(),
            }
            .into());
        }

        let (tx, rx) = bounded::<VirtualInstant>(1);
        let id = {
            let mut state = self.shared.open_state()?;
            let now = state.now_at(self.shared.real_now());
            let id = state.allocate_id();
            state.entries.insert(id, TimerEntry::periodic(id, interval, now, tx));
            id
        };
        self.shared.wake();
        debug!(timer = %id, ?interval, "ticker registered");

        Ok(Ticker::new(id, rx, Arc::clone(&self.shared)))
    }

    /// Creates a one-shot timer that invokes `action` once after `delay`.
    ///
    /// The action is bound to a generated callback token owned by this timer
    /// and is released once the timer fires or stops. A snapshot restore that
    /// revives the timer afterwards finds no action; use
    /// [`TemporalController::after_func_with_token`] for one-shots that must
    /// survive restores.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ControllerClosed` after close.
    pub fn after_func<F>(&self, delay: Duration, action: F) -> TemporaResult<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let action: Action = Arc::new(action);
        self.one_shot(delay, CallbackToken::generate(), Some(action))
    }

    /// Creates a one-shot timer bound to an action registered under `token`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::UnknownCallback` if nothing is registered
    /// under `token`, and `StateError::ControllerClosed` after close.
    pub fn after_func_with_token(&self, delay: Duration, token: CallbackToken) -> TemporaResult<Timer> {
        self.one_shot(delay, token, None)
    }

    fn one_shot(&self, delay: Duration, token: CallbackToken, owned: Option<Action>) -> TemporaResult<Timer> {
        let (tx, rx) = bounded::<()>(1);
        let id = {
            let mut state = self.shared.open_state()?;
            match owned {
                Some(action) => state.actions.register_owned(token.clone(), action),
                None if !state.actions.contains(&token) => {
                    return Err(ValidationError::UnknownCallback {
                        token: token.to_string(),
                    }
                    .into());
                }
                // A second timer on the same token makes it shared.
                None => state.actions.disown(&token),
            }
            let now = state.now_at(self.shared.real_now());
            let id = state.allocate_id();
            state
                .entries
                .insert(id, TimerEntry::one_shot(id, delay, token, now, tx));
            id
        };
        self.shared.wake();
        debug!(timer = %id, ?delay, "one-shot timer registered");

        Ok(Timer::new(id, rx, Arc::clone(&self.shared)))
    }

    /// Binds `action` to `token`, replacing any previous binding.
    ///
    /// Returns true if a previous binding was replaced.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ControllerClosed` after close.
    pub fn register_action<F>(&self, token: CallbackToken, action: F) -> TemporaResult<bool>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let action: Action = Arc::new(action);
        let mut state = self.shared.open_state()?;
        Ok(state.actions.register(token, action))
    }

    /// Sets the global speed multiplier. While globally paused the new speed
    /// is stored and applied on resume.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidSpeed` for negative or non-finite values.
    pub fn set_global_speed(&self, speed: f64) -> TemporaResult<()> {
        let speed = validate_speed(speed)?;
        {
            let mut state = self.shared.open_state()?;
            let real = self.shared.real_now();
            if !state.global_paused {
                state.clock.set_speed_at(speed, real)?;
            }
            state.global_speed = speed;
        }
        self.shared.wake();
        debug!(speed, "global speed changed");
        Ok(())
    }

    /// Global speed multiplier, retained while paused.
    #[must_use]
    pub fn global_speed(&self) -> f64 {
        self.shared.state().global_speed
    }

    /// True while virtual time is globally frozen.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.state().global_paused
    }

    /// Freezes virtual time for every timer. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ControllerClosed` after close.
    pub fn pause_all(&self) -> TemporaResult<()> {
        {
            let mut state = self.shared.open_state()?;
            if state.global_paused {
                return Ok(());
            }
            let real = self.shared.real_now();
            state.clock.pause_at(real);
            state.global_paused = true;
        }
        self.shared.wake();
        debug!("controller paused");
        Ok(())
    }

    /// Resumes virtual time at the stored global speed. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ControllerClosed` after close.
    pub fn resume_all(&self) -> TemporaResult<()> {
        {
            let mut state = self.shared.open_state()?;
            if !state.global_paused {
                return Ok(());
            }
            let real = self.shared.real_now();
            let speed = state.global_speed;
            state.clock.set_speed_at(speed, real)?;
            state.global_paused = false;
        }
        self.shared.wake();
        debug!("controller resumed");
        Ok(())
    }

    /// Advances virtual time to the next due instant among running,
    /// unpaused timers and fires everything due there.
    ///
    /// With no such timer the step is a no-op that reports the current time.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ControllerNotPaused` unless globally paused.
    pub fn step_all(&self) -> TemporaResult<StepReport> {
        let mut cycle = {
            let mut state = self.shared.open_state()?;
            if !state.global_paused {
                return Err(StateError::ControllerNotPaused.into());
            }
            let real = self.shared.real_now();
            let now = state.now_at(real);
            let Some(due) = state.next_step_due() else {
                return Ok(StepReport {
                    virtual_time: now,
                    fired: Vec::new(),
                    breakpoint: None,
                });
            };
            state.clock.advance_virtual_at(due - now, real);
            scheduler::fire_due(&mut state, real)
        };
        self.shared.wake();
        cycle.run_actions();

        Ok(StepReport {
            virtual_time: self.now(),
            fired: std::mem::take(&mut cycle.fired),
            breakpoint: cycle.hit.take(),
        })
    }

    /// Captures the clock and every timer under one lock acquisition.
    ///
    /// Snapshotting does not pause or otherwise perturb the timers.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ControllerClosed` after close.
    pub fn create_snapshot(&self) -> TemporaResult<Snapshot> {
        let snapshot = {
            let state = self.shared.open_state()?;
            Snapshot::capture(&state, self.shared.real_now())
        };
        info!(
            snapshot = %snapshot.id(),
            timers = snapshot.timers().len(),
            virtual_time = %snapshot.clock().virtual_now,
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Restores the clock and the timers captured in `snapshot`.
    ///
    /// Timers only present in the snapshot are recreated (running or stopped,
    /// as captured) and can be picked up with [`reattach_ticker`] or
    /// [`reattach_timer`]. Timers the snapshot does not mention are left alone.
    ///
    /// [`reattach_ticker`]: TemporalController::reattach_ticker
    /// [`reattach_timer`]: TemporalController::reattach_timer
    ///
    /// # Errors
    ///
    /// Returns a `SnapshotError` if the snapshot is malformed or conflicts
    /// with the controller's timers. The controller is unchanged on error.
    pub fn restore_snapshot(&self, snapshot: &Snapshot) -> TemporaResult<()> {
        snapshot.validate()?;
        let released = {
            let mut state = self.shared.open_state()?;
            snapshot.check_compatible(&state)?;
            snapshot.apply(&mut state, self.shared.real_now())?;
            state.take_released()
        };
        drop(released);
        self.shared.wake();
        info!(
            snapshot = %snapshot.id(),
            timers = snapshot.timers().len(),
            virtual_time = %snapshot.clock().virtual_now,
            "snapshot restored"
        );
        Ok(())
    }

    /// Appends a breakpoint. Breakpoints are evaluated in registration order.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ControllerClosed` after close.
    pub fn set_breakpoint(&self, condition: BreakpointCondition) -> TemporaResult<BreakpointId> {
        let id = {
            let mut state = self.shared.open_state()?;
            state.breakpoints.add(condition)
        };
        self.shared.wake();
        Ok(id)
    }

    /// Removes a breakpoint. Returns false if it was not registered.
    pub fn remove_breakpoint(&self, id: BreakpointId) -> bool {
        let removed = self.shared.state().breakpoints.remove(id);
        self.shared.wake();
        removed
    }

    /// Removes every breakpoint.
    pub fn clear_breakpoints(&self) {
        self.shared.state().breakpoints.clear();
        self.shared.wake();
    }

    /// Registered breakpoints in evaluation order.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.shared.state().breakpoints.list().to_vec()
    }

    /// The breakpoint that most recently paused the controller.
    #[must_use]
    pub fn last_breakpoint_hit(&self) -> Option<BreakpointHit> {
        self.shared.state().last_hit.clone()
    }

    /// Ids of every timer the controller tracks, in ascending order.
    ///
    /// Stopped and fired timers are listed while a handle to them is alive.
    #[must_use]
    pub fn timer_ids(&self) -> Vec<TimerId> {
        let state = self.shared.state();
        let mut ids: Vec<TimerId> = state.entries.keys().chain(state.retired.keys()).copied().collect();
        ids.sort_unstable();
        ids
    }

    /// State of any tracked timer.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownTimer` if no timer has this id.
    pub fn timer_state(&self, id: TimerId) -> TemporaResult<TimerState> {
        let state = self.shared.state();
        state
            .entry(id)
            .map(|e| e.state().clone())
            .ok_or_else(|| StateError::UnknownTimer { id }.into())
    }

    /// Hands out a handle for a periodic timer recreated by a restore.
    ///
    /// # Errors
    ///
    /// Returns `StateError::UnknownTimer` for an unknown id,
    /// `StateError::KindMismatch` for a one-shot timer and
    /// `StateError::AlreadyAttached` if the handle was already taken or the
    /// timer was created through this controller.
    pub fn reattach_ticker(&self, id: TimerId) -> TemporaResult<Ticker> {
        let rx = {
            let mut state = self.shared.open_state()?;
            Self::take_detached(&mut state, id, TimerKind::Periodic)?
        };
        match rx {
            DetachedReceiver::Periodic(rx) => Ok(Ticker::new(id, rx, Arc::clone(&self.shared))),
            DetachedReceiver::OneShot(_) => Err(TemporaError::internal("detached receiver kind drifted")),
        }
    }

    /// Hands out a handle for a one-shot timer recreated by a restore.
    ///
    /// # Errors
    ///
    /// Same as [`TemporalController::reattach_ticker`], with the kinds swapped.
    pub fn reattach_timer(&self, id: TimerId) -> TemporaResult<Timer> {
        let rx = {
            let mut state = self.shared.open_state()?;
            Self::take_detached(&mut state, id, TimerKind::OneShot)?
        };
        match rx {
            DetachedReceiver::OneShot(rx) => Ok(Timer::new(id, rx, Arc::clone(&self.shared))),
            DetachedReceiver::Periodic(_) => Err(TemporaError::internal("detached receiver kind drifted")),
        }
    }

    fn take_detached(
        state: &mut ControllerState,
        id: TimerId,
        expected: TimerKind,
    ) -> Result<DetachedReceiver, StateError> {
        let kind = state
            .entry(id)
            .map(TimerEntry::kind)
            .ok_or(StateError::UnknownTimer { id })?;
        if kind != expected {
            return Err(StateError::KindMismatch {
                id,
                expected,
                actual: kind,
            });
        }
        state
            .detached
            .remove(&id)
            .ok_or(StateError::AlreadyAttached { id })
    }
}

impl Drop for TemporalController {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualWallClock;
    use crate::timer::{StandardTimer, TemporalTimer, TimerStatus};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn paused_controller() -> (TemporalController, Arc<ManualWallClock>) {
        let wall = Arc::new(ManualWallClock::new());
        let controller = TemporalController::with_wall_clock(
            ControllerConfig {
                start_paused: true,
                ..ControllerConfig::default()
            },
            wall.clone(),
        )
        .unwrap();
        (controller, wall)
    }

    #[test]
    fn test_rejects_invalid_initial_speed() {
        let err = TemporalController::new(ControllerConfig {
            initial_speed: -1.0,
            ..ControllerConfig::default()
        })
        .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_ids_are_allocated_in_creation_order() {
        let (controller, _wall) = paused_controller();
        let a = controller.new_ticker(ms(5)).unwrap();
        let b = controller.after_func(ms(5), || {}).unwrap();
        assert!(a.id() < b.id());
        assert_eq!(controller.timer_ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn test_zero_interval_ticker_rejected() {
        let (controller, _wall) = paused_controller();
        assert!(controller.new_ticker(Duration::ZERO).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_pause_and_resume_are_idempotent() {
        let (controller, wall) = paused_controller();
        controller.resume_all().unwrap();
        controller.resume_all().unwrap();
        wall.advance(ms(10));
        assert_eq!(controller.now(), VirtualInstant::ZERO + ms(10));

        controller.pause_all().unwrap();
        controller.pause_all().unwrap();
        wall.advance(ms(10));
        assert!(controller.is_paused());
        assert_eq!(controller.now(), VirtualInstant::ZERO + ms(10));
    }

    #[test]
    fn test_global_speed_while_paused_applies_on_resume() {
        let (controller, wall) = paused_controller();
        controller.set_global_speed(3.0).unwrap();
        wall.advance(ms(10));
        assert_eq!(controller.now(), VirtualInstant::ZERO);

        controller.resume_all().unwrap();
        wall.advance(ms(10));
        assert_eq!(controller.now(), VirtualInstant::ZERO + ms(30));
        assert!(controller.set_global_speed(f64::NAN).unwrap_err().is_invalid_argument());
        assert_eq!(controller.global_speed(), 3.0);
        controller.pause_all().unwrap();
    }

    #[test]
    fn test_step_all_requires_global_pause() {
        let wall = Arc::new(ManualWallClock::new());
        let controller = TemporalController::with_wall_clock(ControllerConfig::default(), wall).unwrap();
        let err = controller.step_all().unwrap_err();
        assert_eq!(err, TemporaError::InvalidState(StateError::ControllerNotPaused));
    }

    #[test]
    fn test_step_all_without_timers_is_a_no_op() {
        let (controller, _wall) = paused_controller();
        let report = controller.step_all().unwrap();
        assert!(report.fired.is_empty());
        assert_eq!(report.virtual_time, VirtualInstant::ZERO);
    }

    #[test]
    fn test_after_func_with_unknown_token_rejected() {
        let (controller, _wall) = paused_controller();
        let token = CallbackToken::new("missing").unwrap();
        let err = controller.after_func_with_token(ms(1), token).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_close_rejects_mutation_but_allows_inspection() {
        let (controller, _wall) = paused_controller();
        let ticker = controller.new_ticker(ms(5)).unwrap();
        controller.close();
        controller.close();

        assert!(controller.is_closed());
        assert_eq!(
            controller.new_ticker(ms(5)).unwrap_err(),
            TemporaError::InvalidState(StateError::ControllerClosed)
        );
        assert_eq!(
            ticker.pause().unwrap_err(),
            TemporaError::InvalidState(StateError::ControllerClosed)
        );
        assert_eq!(ticker.tick_count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_timer_state() {
        let (controller, _wall) = paused_controller();
        let err = controller.timer_state(TimerId::from_raw(99)).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn test_fired_one_shots_release_entries_and_actions() {
        let (controller, _wall) = paused_controller();
        let mut tokens = Vec::new();
        for _ in 0..1_000 {
            let timer = controller.after_func(ms(1), || {}).unwrap();
            tokens.push(timer.state().unwrap().callback_token.unwrap());
            controller.step_all().unwrap();
        }

        let state = controller.shared.state();
        assert!(state.entries.is_empty());
        assert!(state.retired.is_empty());
        assert_eq!(state.actions.len(), 0);
        assert!(tokens.iter().all(|t| !state.actions.contains(t)));
    }

    #[test]
    fn test_finished_timers_leave_the_scheduled_set() {
        let (controller, _wall) = paused_controller();
        let fired: Vec<Timer> = (0..100)
            .map(|_| controller.after_func(ms(1), || {}).unwrap())
            .collect();
        let stopped = controller.after_func(ms(50), || {}).unwrap();
        controller.step_all().unwrap();
        assert!(stopped.stop().unwrap());

        {
            let state = controller.shared.state();
            assert!(state.entries.is_empty());
            assert_eq!(state.retired.len(), 101);
            assert_eq!(state.actions.len(), 0);
        }
        assert!(fired.iter().all(|t| t.status().unwrap() == TimerStatus::Fired));

        drop(fired);
        drop(stopped);
        assert!(controller.timer_ids().is_empty());
    }

    #[test]
    fn test_named_actions_outlive_their_timers() {
        let (controller, _wall) = paused_controller();
        let token = CallbackToken::new("checkpoint").unwrap();
        controller.register_action(token.clone(), || {}).unwrap();
        drop(controller.after_func_with_token(ms(1), token.clone()).unwrap());
        controller.step_all().unwrap();

        assert!(controller.shared.state().actions.contains(&token));
        assert!(controller.after_func_with_token(ms(1), token).is_ok());
    }

    #[test]
    fn test_released_action_may_own_a_handle() {
        let (controller, _wall) = paused_controller();
        let ticker = controller.new_ticker(ms(100)).unwrap();
        let ticker_id = ticker.id();
        let timer = controller
            .after_func(ms(10), move || {
                let _ = ticker.tick_count();
            })
            .unwrap();

        // Stopping releases the action, which drops the ticker handle it owns.
        assert!(timer.stop().unwrap());
        assert_eq!(controller.timer_ids(), vec![ticker_id, timer.id()]);
        drop(timer);
        assert_eq!(controller.timer_ids(), vec![ticker_id]);
        assert_eq!(controller.step_all().unwrap().fired, vec![ticker_id]);
    }

    #[test]
    fn test_reattach_rejects_live_handles() {
        let (controller, _wall) = paused_controller();
        let ticker = controller.new_ticker(ms(5)).unwrap();
        assert_eq!(
            controller.reattach_ticker(ticker.id()).unwrap_err(),
            TemporaError::InvalidState(StateError::AlreadyAttached { id: ticker.id() })
        );
        assert!(controller.reattach_timer(ticker.id()).unwrap_err().is_invalid_state());
    }
}
