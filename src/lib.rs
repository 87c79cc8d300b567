//! # Tempora - Virtual-Time Scheduling
//!
//! Tempora drives periodic and one-shot timers from a controllable virtual
//! clock instead of the wall clock. Virtual time can be paused, sped up,
//! slowed down, single-stepped, checkpointed and restored without losing
//! the temporal relationships between timers.
//!
//! ## Core Concepts
//!
//! - **VirtualClock**: anchor/speed mapping from wall time to virtual time
//! - **TemporalController**: owns the clock, the timers and the scheduler thread
//! - **Ticker / Timer**: handles to periodic and one-shot timers, each with its own speed
//! - **Snapshot**: serializable capture of the controller, restorable exactly
//! - **Breakpoint**: a temporal condition that pauses the controller when met
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tempora::{BreakpointCondition, ControllerConfig, TemporalController, TemporalTimer};
//!
//! let controller = TemporalController::new(ControllerConfig {
//!     start_paused: true,
//!     ..ControllerConfig::default()
//! })?;
//!
//! let heartbeat = controller.new_ticker(Duration::from_millis(5))?;
//! controller.set_breakpoint(BreakpointCondition::TickCount {
//!     timer_id: heartbeat.id(),
//!     count: 3,
//! })?;
//!
//! for _ in 0..3 {
//!     controller.step_all()?;
//! }
//! assert_eq!(heartbeat.tick_count()?, 3);
//! assert!(controller.last_breakpoint_hit().is_some());
//!
//! let checkpoint = controller.create_snapshot()?;
//! controller.step_all()?;
//! controller.restore_snapshot(&checkpoint)?;
//! assert_eq!(heartbeat.tick_count()?, 3);
//! # Ok::<(), tempora::TemporaError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Time primitives
pub mod clock;
pub mod error;
pub mod time;

// Timers and their coordination
pub mod action;
pub mod breakpoint;
pub mod controller;
pub(crate) mod scheduler;
pub mod snapshot;
pub mod timer;

// Re-export primary types at crate root for convenience
pub use action::Action;
pub use breakpoint::{Breakpoint, BreakpointCondition, BreakpointHit, BreakpointId};
pub use clock::{validate_speed, VirtualClock};
pub use controller::{ControllerConfig, StepReport, TemporalController};
pub use error::{SnapshotError, StateError, TemporaError, TemporaResult, ValidationError};
pub use snapshot::{ClockSnapshot, Snapshot, SnapshotId, SNAPSHOT_FORMAT_VERSION};
pub use time::{ManualWallClock, SystemWallClock, VirtualInstant, WallClock};
pub use timer::{
    CallbackToken, StandardTimer, TemporalTimer, Ticker, Timer, TimerId, TimerKind, TimerState, TimerStatus,
};
