//! Coordinating scheduler worker.
//!
//! One worker thread per controller arbitrates all timer state. Each turn
//! it computes the earliest virtual deadline, converts it to a wall wait
//! through the virtual clock and sleeps on the wake channel with that
//! timeout. Any state-changing operation sends a wake, so a speed change or
//! a new timer takes effect immediately rather than after the old wait.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use tracing::{debug, error, info, trace, warn};

use crate::action::Action;
use crate::breakpoint::BreakpointHit;
use crate::controller::{ControllerState, Shared};
use crate::time::VirtualInstant;
use crate::timer::entry::Fire;
use crate::timer::{CallbackToken, TimerId};

/// Result of one fire cycle, handed back once the state lock is released.
#[derive(Default)]
pub(crate) struct FireCycle {
    pub fired: Vec<TimerId>,
    pub actions: Vec<(CallbackToken, Action)>,
    pub hit: Option<BreakpointHit>,
    /// Owned actions the cycle unbound, dropped with the cycle outside the lock.
    pub released: Vec<Action>,
}

impl FireCycle {
    /// Invokes one-shot actions. Must be called without holding the state lock,
    /// since actions may call back into the controller.
    pub fn run_actions(&mut self) {
        for (token, action) in self.actions.drain(..) {
            if catch_unwind(AssertUnwindSafe(|| action())).is_err() {
                error!(token = %token, "timer action panicked");
            }
        }
        self.released.clear();
    }
}

/// Fires every schedulable entry due at or before the current virtual time,
/// in ascending id order, then evaluates breakpoints.
pub(crate) fn fire_due(state: &mut ControllerState, real: Duration) -> FireCycle {
    let now = state.clock.now_at(real);
    let mut fires = Vec::new();
    for entry in state.entries.values_mut() {
        if entry.is_schedulable() && entry.next_due() <= now {
            fires.push(entry.fire(now));
        }
    }
    settle(state, fires, now, real)
}

/// Resolves actions for `fires`, evaluates breakpoints and, on a hit, pauses
/// the controller before the caller releases the lock. Timers the cycle
/// finished leave the active set.
pub(crate) fn settle(state: &mut ControllerState, fires: Vec<Fire>, now: VirtualInstant, real: Duration) -> FireCycle {
    let mut cycle = FireCycle::default();
    let mut finished = Vec::new();

    for fire in fires {
        trace!(timer = %fire.id, at = %fire.at, delivered = fire.delivered, "timer fired");
        if let Some(token) = fire.callback {
            match state.actions.get(&token) {
                Some(action) => cycle.actions.push((token, action)),
                None => warn!(timer = %fire.id, token = %token, "no action registered for callback token"),
            }
        }
        if fire.finished {
            finished.push(fire.id);
        }
        cycle.fired.push(fire.id);
    }

    let (entries, retired) = (&state.entries, &state.retired);
    cycle.hit = state.breakpoints.evaluate(&cycle.fired, now, |id| {
        entries
            .get(&id)
            .or_else(|| retired.get(&id))
            .map(|e| e.state().tick_count)
    });

    for id in finished {
        state.refile(id);
    }
    cycle.released = state.take_released();

    if let Some(hit) = &cycle.hit {
        state.global_paused = true;
        state.clock.pause_at(real);
        state.last_hit = Some(hit.clone());
        info!(
            breakpoint = ?hit.breakpoint_id,
            condition = ?hit.condition,
            virtual_time = %hit.virtual_time,
            "breakpoint hit, controller paused"
        );
    }

    cycle
}

pub(crate) fn spawn(shared: Arc<Shared>, wake_rx: Receiver<()>, name: String) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(&shared, &wake_rx))
}

fn worker_loop(shared: &Shared, wake_rx: &Receiver<()>) {
    debug!("scheduler started");

    loop {
        let wait = {
            let mut state = shared.state();
            if state.closed {
                break;
            }
            let real = shared.real_now();
            let deadline = state.deadline();
            match deadline.map(|at| state.clock.real_until(at, real)) {
                // Nothing runnable, or virtual time is frozen: sleep until woken.
                None | Some(None) => None,
                Some(Some(wait)) if wait.is_zero() => {
                    let mut cycle = fire_due(&mut state, real);
                    drop(state);
                    cycle.run_actions();
                    continue;
                }
                Some(Some(wait)) => Some(wait),
            }
        };

        match wait {
            Some(timeout) => {
                select! {
                    recv(wake_rx) -> msg => {
                        if msg.is_err() {
                            break;
                        }
                    }
                    default(timeout) => {}
                }
            }
            None => {
                if wake_rx.recv().is_err() {
                    break;
                }
            }
        }
    }

    debug!("scheduler stopped");
}
