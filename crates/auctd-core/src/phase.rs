//! The global phase vocabulary.
//!
//! Exactly one `Phase` is active process-wide at any instant. The Phase
//! Clock owns the current phase and all time indices (`GameTime`); every
//! other component reads them through snapshots.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the global game/day/round state machine.
///
/// Phases advance in the order listed; `RoundOpened` through `RoundClosed`
/// repeat per round, `DayOpening` through `DayClosed` repeat per day, and
/// `GameStarting` through `GameOver` repeat per game iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    SimulationStarted,
    GameStarting,
    GameStarted,
    DayOpening,
    DayOpened,
    RoundOpened,
    RoundClosing,
    RoundClosed,
    DayClosed,
    GameOver,
    SimulationOver,
}

impl Phase {
    /// Whether orders are legal: from day opening completion until the
    /// round structure closes them out again.
    #[must_use]
    pub fn trading_open(&self) -> bool {
        matches!(self, Self::DayOpened | Self::RoundOpened)
    }

    /// Whether operators may strike settlements.
    #[must_use]
    pub fn clearing_open(&self) -> bool {
        matches!(self, Self::RoundOpened | Self::RoundClosing)
    }

    /// Whether the fee-posting exchange runs in this phase.
    #[must_use]
    pub fn solicits_fees(&self) -> bool {
        matches!(self, Self::DayOpening)
    }

    /// Whether the simulation has reached its terminal phase.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SimulationOver)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SimulationStarted => "SimulationStarted",
            Self::GameStarting => "GameStarting",
            Self::GameStarted => "GameStarted",
            Self::DayOpening => "DayOpening",
            Self::DayOpened => "DayOpened",
            Self::RoundOpened => "RoundOpened",
            Self::RoundClosing => "RoundClosing",
            Self::RoundClosed => "RoundClosed",
            Self::DayClosed => "DayClosed",
            Self::GameOver => "GameOver",
            Self::SimulationOver => "SimulationOver",
        };
        write!(f, "{name}")
    }
}

/// Time indices owned by the Phase Clock.
///
/// `tick_ms` is the elapsed time inside the current round, with any time
/// the clock spent blocked on a synchronization gate excluded, clamped to
/// the configured round length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GameTime {
    /// Game iteration index (0-based).
    pub game: u32,
    /// Day index within the game (0-based).
    pub day: u32,
    /// Round index within the day (0-based).
    pub round: u32,
    /// Elapsed milliseconds within the current round.
    pub tick_ms: u64,
}

impl GameTime {
    /// Wire encoding used by the `Time` header: `day,round,tick`.
    #[must_use]
    pub fn wire_encode(&self) -> String {
        format!("{},{},{}", self.day, self.round, self.tick_ms)
    }

    /// The staleness tag carried by the `Tag` header (the day index).
    #[must_use]
    pub fn tag(&self) -> String {
        self.day.to_string()
    }
}

impl fmt::Display for GameTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "g{}/d{}/r{}@{}ms",
            self.game, self.day, self.round, self.tick_ms
        )
    }
}

/// A gate tag: one phase transition of one game/day/round instance.
///
/// Gate instances are keyed by this tag so that a late acknowledgment for
/// an earlier transition can never satisfy a later gate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhaseTag {
    pub phase: Phase,
    pub game: u32,
    pub day: u32,
    pub round: u32,
}

impl PhaseTag {
    #[must_use]
    pub fn new(phase: Phase, time: GameTime) -> Self {
        Self {
            phase,
            game: time.game,
            day: time.day,
            round: time.round,
        }
    }
}

impl fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:g{}/d{}/r{}",
            self.phase, self.game, self.day, self.round
        )
    }
}

/// Shared snapshot of the clock's current phase and time.
///
/// Written only by the Phase Clock; everyone else reads. Late joiners
/// use it to pick up the grammar for the phase already in progress.
pub struct PhaseBoard {
    current: RwLock<(Phase, GameTime)>,
}

impl PhaseBoard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: RwLock::new((Phase::SimulationStarted, GameTime::default())),
        }
    }

    /// Publish a new phase/time pair. Clock only.
    pub fn publish(&self, phase: Phase, time: GameTime) {
        *self.current.write() = (phase, time);
    }

    /// Point-in-time snapshot of the current phase and time.
    #[must_use]
    pub fn current(&self) -> (Phase, GameTime) {
        *self.current.read()
    }
}

impl Default for PhaseBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_board_starts_at_simulation_started() {
        let board = PhaseBoard::new();
        let (phase, time) = board.current();
        assert_eq!(phase, Phase::SimulationStarted);
        assert_eq!(time, GameTime::default());
    }

    #[test]
    fn test_phase_board_publishes() {
        let board = PhaseBoard::new();
        let time = GameTime {
            game: 1,
            day: 2,
            round: 3,
            tick_ms: 40,
        };
        board.publish(Phase::RoundOpened, time);
        assert_eq!(board.current(), (Phase::RoundOpened, time));
    }

    #[test]
    fn test_trading_window() {
        assert!(Phase::DayOpened.trading_open());
        assert!(Phase::RoundOpened.trading_open());
        assert!(!Phase::RoundClosing.trading_open());
        assert!(!Phase::DayOpening.trading_open());
        assert!(!Phase::GameStarted.trading_open());
    }

    #[test]
    fn test_clearing_window() {
        assert!(Phase::RoundOpened.clearing_open());
        assert!(Phase::RoundClosing.clearing_open());
        assert!(!Phase::DayOpened.clearing_open());
    }

    #[test]
    fn test_fee_solicitation_phase() {
        assert!(Phase::DayOpening.solicits_fees());
        assert!(!Phase::DayOpened.solicits_fees());
    }

    #[test]
    fn test_game_time_wire_encoding() {
        let t = GameTime {
            game: 0,
            day: 5,
            round: 2,
            tick_ms: 1500,
        };
        assert_eq!(t.wire_encode(), "5,2,1500");
        assert_eq!(t.tag(), "5");
    }

    #[test]
    fn test_phase_tag_distinguishes_instances() {
        let t1 = GameTime {
            game: 0,
            day: 1,
            round: 0,
            tick_ms: 0,
        };
        let t2 = GameTime {
            game: 0,
            day: 2,
            round: 0,
            tick_ms: 0,
        };
        assert_ne!(
            PhaseTag::new(Phase::DayOpening, t1),
            PhaseTag::new(Phase::DayOpening, t2)
        );
        assert_eq!(
            PhaseTag::new(Phase::DayOpening, t1),
            PhaseTag::new(Phase::DayOpening, t1)
        );
    }
}
