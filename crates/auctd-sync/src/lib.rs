//! Timing primitives for the auction server.
//!
//! - `TimerPool`: pooled, cancellable one-shot timers backing every
//!   outstanding request's bounded wait
//! - `SyncGate`: a countdown barrier with a bounded wait, used to softly
//!   synchronize phase transitions

pub mod gate;
pub mod timer;

pub use gate::{GateOutcome, SyncGate};
pub use timer::{TimerHandle, TimerPool};
