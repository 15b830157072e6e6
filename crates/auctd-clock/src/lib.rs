//! The phase clock: single authority over the global phase sequence.

pub mod clock;

pub use clock::{ClockConfig, ClockHandle, PhaseClock};
