//! Engine events routed between the clock and sessions.
//!
//! Events are event-class dispatcher tasks: they mutate session state
//! (phase, grammars, parked exchanges). Wire notifications to remote
//! participants travel separately as message-class tasks.

use auctd_core::{GameTime, Order, ParticipantId, Phase, Settlement};

/// An event delivered into a session's inbound queue.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A phase transition fired by the clock.
    PhaseBegun { phase: Phase, time: GameTime },

    /// A validated order forwarded to the owning operator session.
    OrderSubmitted { order: Order },

    /// An operator's admission decision, routed back to the submitter.
    OrderDecided {
        order_id: u64,
        submitter: ParticipantId,
        accepted: bool,
        reason: Option<String>,
    },

    /// A settlement struck by an operator, routed to each counterparty.
    SettlementExecuted { settlement: Settlement },
}

impl EngineEvent {
    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::PhaseBegun { .. } => "phase_begun",
            Self::OrderSubmitted { .. } => "order_submitted",
            Self::OrderDecided { .. } => "order_decided",
            Self::SettlementExecuted { .. } => "settlement_executed",
        }
    }
}
