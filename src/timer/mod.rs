//! Timers: state values, the scheduler-side entry and caller-side handles.

pub(crate) mod entry;
pub mod handle;
pub mod state;

pub use handle::{StandardTimer, TemporalTimer, Ticker, Timer};
pub use state::{CallbackToken, TimerId, TimerKind, TimerState, TimerStatus};
