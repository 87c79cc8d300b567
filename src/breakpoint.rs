//! Breakpoints on temporal conditions.
//!
//! Conditions are a closed, serializable set. The scheduler evaluates them
//! after every fire cycle; the first matching breakpoint in registration
//! order pauses the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::VirtualInstant;
use crate::timer::TimerId;

/// Unique identifier for a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakpointId(Uuid);

impl BreakpointId {
    /// Create a new random breakpoint id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BreakpointId {
    fn default() -> Self {
        Self::new()
    }
}

/// Breakpoint condition definitions.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakpointCondition {
    /// The timer fired in the last cycle.
    TimerFired { timer_id: TimerId },

    /// Virtual time crossed `at`.
    TimeReached { at: VirtualInstant },

    /// The timer fired and its tick count is now exactly `count`.
    TickCount { timer_id: TimerId, count: u64 },
}

/// A registered breakpoint.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub condition: BreakpointCondition,
}

/// Record of a breakpoint that paused the controller.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakpointHit {
    pub breakpoint_id: BreakpointId,
    pub condition: BreakpointCondition,
    pub virtual_time: VirtualInstant,
    /// Timers that fired in the cycle that matched.
    pub fired: Vec<TimerId>,
    pub recorded_at: DateTime<Utc>,
}

/// Ordered breakpoint list plus the evaluation cursor for time conditions.
#[derive(Debug, Default)]
pub(crate) struct BreakpointEvaluator {
    breakpoints: Vec<Breakpoint>,
    last_evaluated: Option<VirtualInstant>,
}

impl BreakpointEvaluator {
    pub fn add(&mut self, condition: BreakpointCondition) -> BreakpointId {
        let id = BreakpointId::new();
        self.breakpoints.push(Breakpoint { id, condition });
        id
    }

    pub fn remove(&mut self, id: BreakpointId) -> bool {
        let before = self.breakpoints.len();
        self.breakpoints.retain(|b| b.id != id);
        self.breakpoints.len() != before
    }

    pub fn clear(&mut self) {
        self.breakpoints.clear();
    }

    pub fn list(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Moves the time cursor without evaluating, e.g. after a restore jumps
    /// virtual time. `TimeReached` conditions only match on a forward crossing.
    pub fn move_cursor_to(&mut self, now: VirtualInstant) {
        self.last_evaluated = Some(now);
    }

    /// Earliest `TimeReached` instant not yet crossed, for the scheduler's
    /// deadline computation.
    pub fn next_time_condition(&self) -> Option<VirtualInstant> {
        self.breakpoints
            .iter()
            .filter_map(|b| match b.condition {
                BreakpointCondition::TimeReached { at } => Some(at),
                _ => None,
            })
            .filter(|at| self.last_evaluated.map_or(true, |last| last < *at))
            .min()
    }

    /// Evaluates all breakpoints against one fire cycle.
    ///
    /// `tick_count` looks up a timer's current tick count.
    pub fn evaluate<F>(&mut self, fired: &[TimerId], now: VirtualInstant, tick_count: F) -> Option<BreakpointHit>
    where
        F: Fn(TimerId) -> Option<u64>,
    {
        let previous = self.last_evaluated.replace(now);

        let matched = self.breakpoints.iter().find(|b| match &b.condition {
            BreakpointCondition::TimerFired { timer_id } => fired.contains(timer_id),
            BreakpointCondition::TimeReached { at } => {
                now >= *at && previous.map_or(true, |last| last < *at)
            }
            BreakpointCondition::TickCount { timer_id, count } => {
                fired.contains(timer_id) && tick_count(*timer_id) == Some(*count)
            }
        })?;

        Some(BreakpointHit {
            breakpoint_id: matched.id,
            condition: matched.condition.clone(),
            virtual_time: now,
            fired: fired.to_vec(),
            recorded_at: Utc::now(),
        })
    }
}
