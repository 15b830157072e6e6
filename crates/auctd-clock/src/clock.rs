//! The phase clock driver.
//!
//! Walks `iterations × (game-init → days × (day-init → rounds × round-body)
//! → game-over)` over the global phase sequence. Every transition arms the
//! sync gate with the participants expected to acknowledge, fans the phase
//! event out, waits up to the configured bound, and proceeds regardless:
//! a timed-out gate produces one warning naming the missing participants
//! and never halts the game.
//!
//! The clock cannot fail: `run` completes the whole simulation or returns
//! early when externally stopped.

use auctd_core::{GameTime, ParticipantId, Phase, PhaseBoard, PhaseTag, Role};
use auctd_session::{ConnectionRegistry, Dispatcher, EngineEvent};
use auctd_sync::SyncGate;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Clock timing and structure configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Number of game iterations.
    pub games: u32,
    /// Trading days per game.
    pub days_per_game: u32,
    /// Rounds per day.
    pub rounds_per_day: u32,
    /// Trading time per round, in milliseconds.
    pub round_len_ms: u64,
    /// Sleep between GameStarting and GameStarted.
    pub game_init_ms: u64,
    /// Sleep after GameOver before the next game.
    pub game_break_ms: u64,
    /// Sleep between DayOpening and DayOpened.
    pub day_init_ms: u64,
    /// Sleep between rounds.
    pub round_break_ms: u64,
    /// Bounded wait on every phase gate.
    pub sync_timeout_ms: u64,
    /// Real-time mode sleeps between phases; synchronous mode skips every
    /// sleep but still requires the gates.
    pub realtime: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            games: 1,
            days_per_game: 5,
            rounds_per_day: 10,
            round_len_ms: 10_000,
            game_init_ms: 2_000,
            game_break_ms: 2_000,
            day_init_ms: 1_000,
            round_break_ms: 500,
            sync_timeout_ms: 5_000,
            realtime: true,
        }
    }
}

struct HandleInner {
    paused: AtomicBool,
    resume: Notify,
    shutdown: CancellationToken,
}

/// External controller surface for a running clock.
///
/// Pause requests take effect at the next day or round boundary, never
/// mid-round, bounding pause latency to one round.
#[derive(Clone)]
pub struct ClockHandle {
    inner: Arc<HandleInner>,
}

impl ClockHandle {
    fn new(shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                paused: AtomicBool::new(false),
                resume: Notify::new(),
                shutdown,
            }),
        }
    }

    /// Request a pause at the next day/round boundary.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        info!("Clock pause requested");
    }

    /// Resume a paused clock.
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.resume.notify_waiters();
        info!("Clock resumed");
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Stop the clock at the next phase boundary.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// The top-level phase driver.
pub struct PhaseClock {
    config: ClockConfig,
    gate: Arc<SyncGate>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    board: Arc<PhaseBoard>,
    handle: ClockHandle,
    time: GameTime,
}

impl PhaseClock {
    pub fn new(
        config: ClockConfig,
        gate: Arc<SyncGate>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<ConnectionRegistry>,
        board: Arc<PhaseBoard>,
        shutdown: CancellationToken,
    ) -> (Self, ClockHandle) {
        let handle = ClockHandle::new(shutdown);
        let clock = Self {
            config,
            gate,
            dispatcher,
            registry,
            board,
            handle: handle.clone(),
            time: GameTime::default(),
        };
        (clock, handle)
    }

    /// Drive the whole simulation.
    pub async fn run(mut self) {
        info!(
            games = self.config.games,
            days = self.config.days_per_game,
            rounds = self.config.rounds_per_day,
            realtime = self.config.realtime,
            "Phase clock started"
        );

        self.transition(Phase::SimulationStarted).await;

        'games: for game in 0..self.config.games {
            self.time.game = game;
            self.time.round = 0;
            self.time.tick_ms = 0;

            self.transition(Phase::GameStarting).await;
            self.sleep(self.config.game_init_ms).await;
            self.transition(Phase::GameStarted).await;

            for _ in 0..self.config.days_per_game {
                self.pause_point().await;
                if self.stopped() {
                    break 'games;
                }

                self.time.round = 0;
                self.time.tick_ms = 0;

                // Fee-posting phase: only the market operators are
                // expected at the gate.
                self.transition_expecting(
                    Phase::DayOpening,
                    self.registry.active_by_role(Role::Operator),
                )
                .await;
                self.sleep(self.config.day_init_ms).await;
                self.transition(Phase::DayOpened).await;

                for round in 0..self.config.rounds_per_day {
                    self.pause_point().await;
                    if self.stopped() {
                        break 'games;
                    }

                    self.time.round = round;
                    self.time.tick_ms = 0;

                    // Time the clock spends blocked on the gate is
                    // excluded from the round's trading time.
                    let round_start = Instant::now();
                    let blocked = self.transition(Phase::RoundOpened).await;

                    self.sleep(self.config.round_len_ms).await;
                    self.time.tick_ms = round_tick_ms(
                        round_start.elapsed(),
                        blocked,
                        self.config.round_len_ms,
                    );

                    self.transition(Phase::RoundClosing).await;
                    self.transition(Phase::RoundClosed).await;
                    self.sleep(self.config.round_break_ms).await;
                }

                self.transition(Phase::DayClosed).await;
                // Day indices are absolute across games so the wire tag
                // never repeats.
                self.time.day += 1;
            }

            self.transition(Phase::GameOver).await;
            self.sleep(self.config.game_break_ms).await;
        }

        self.transition(Phase::SimulationOver).await;
        info!("Phase clock finished");
    }

    fn stopped(&self) -> bool {
        self.handle.inner.shutdown.is_cancelled()
    }

    /// Transition expecting every active participant at the gate.
    async fn transition(&mut self, phase: Phase) -> Duration {
        let expected = self.registry.active();
        self.transition_expecting(phase, expected).await
    }

    /// Run one phase transition: publish, arm, fan out, bounded wait.
    ///
    /// Returns the time spent blocked on the gate.
    async fn transition_expecting(
        &mut self,
        phase: Phase,
        expected: Vec<ParticipantId>,
    ) -> Duration {
        self.board.publish(phase, self.time);
        let tag = PhaseTag::new(phase, self.time);
        debug!(tag = %tag, expected = expected.len(), "Phase transition");

        self.gate.arm(tag.clone(), expected);
        self.dispatcher.broadcast_event(
            self.registry.active(),
            EngineEvent::PhaseBegun {
                phase,
                time: self.time,
            },
        );

        let wait_start = Instant::now();
        let outcome = self
            .gate
            .await_up_to(Duration::from_millis(self.config.sync_timeout_ms))
            .await;
        if !outcome.satisfied {
            // Soft barrier: proceed anyway, with exactly one warning
            // naming the laggards.
            let missing: Vec<String> =
                outcome.missing.iter().map(ToString::to_string).collect();
            warn!(tag = %tag, missing = ?missing, "Phase gate timed out");
        }
        wait_start.elapsed()
    }

    /// Real-time inter-phase sleep; a no-op in synchronous mode.
    async fn sleep(&self, ms: u64) {
        if !self.config.realtime || ms == 0 {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(ms)) => {}
            () = self.handle.inner.shutdown.cancelled() => {}
        }
    }

    /// Block while paused. Checked at day and round starts only.
    async fn pause_point(&self) {
        while self.handle.is_paused() && !self.stopped() {
            let resumed = self.handle.inner.resume.notified();
            if !self.handle.is_paused() {
                return;
            }
            tokio::select! {
                () = resumed => {}
                () = self.handle.inner.shutdown.cancelled() => {}
            }
        }
    }
}

/// In-round elapsed time: wall time minus gate-blocked time, clamped to
/// the round length.
#[must_use]
pub fn round_tick_ms(wall: Duration, blocked: Duration, round_len_ms: u64) -> u64 {
    let unblocked = wall.saturating_sub(blocked);
    (unblocked.as_millis() as u64).min(round_len_ms)
}
