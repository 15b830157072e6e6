//! Proactive exchanges: requests the server initiates and awaits.
//!
//! One `ExchangeKind` tagged variant per server-initiated request shape,
//! with the build-request / handle-response / on-timeout behavior keyed
//! off the tag instead of one type per message shape.

use auctd_core::{GameTime, Order, PhaseTag};
use auctd_sync::TimerHandle;
use auctd_wire::{Message, Verb};

/// The kinds of server-initiated exchanges.
#[derive(Debug, Clone)]
pub enum ExchangeKind {
    /// Phase notice awaiting acknowledgment; the response decrements the
    /// phase gate for `tag`.
    PhaseSync { tag: PhaseTag },

    /// Day-opening fee solicitation to a market operator; the response
    /// carries the proposed fee schedule.
    FeeQuote { tag: PhaseTag },

    /// An order forwarded to its owning operator for admission; the
    /// response resolves the submitter's parked request.
    OrderDecision { order: Order },
}

impl ExchangeKind {
    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::PhaseSync { .. } => "phase_sync",
            Self::FeeQuote { .. } => "fee_quote",
            Self::OrderDecision { .. } => "order_decision",
        }
    }

    /// Build the outgoing request for this exchange.
    ///
    /// The exchange id rides in `Id` so the eventual response correlates
    /// back; `Tag` pins the day the request belongs to.
    #[must_use]
    pub fn build_request(&self, exchange_id: u64, time: GameTime) -> Message {
        let base = Message::new(Verb::Post)
            .with_id(exchange_id.to_string())
            .with_tag(time.tag())
            .with_time(time.into());
        match self {
            Self::PhaseSync { tag } => base
                .with_type("phase")
                .with_value(tag.phase.to_string()),
            Self::FeeQuote { .. } => base.with_type("fee-request"),
            Self::OrderDecision { order } => base.with_type("order").with_value(format!(
                "{},{},{},{}",
                order.id, order.side, order.price, order.quantity
            )),
        }
    }
}

/// Correlation record linking one outstanding request to its eventual
/// response or timeout.
///
/// Destroyed when the response arrives, the timeout fires, or the owning
/// session closes: whichever happens first, exactly once.
#[derive(Debug)]
pub struct PendingExchange {
    pub id: u64,
    pub kind: ExchangeKind,
    pub timer: TimerHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use auctd_core::{OrderSide, ParticipantId, Phase, Price};
    use rust_decimal_macros::dec;

    fn time() -> GameTime {
        GameTime {
            game: 0,
            day: 4,
            round: 1,
            tick_ms: 250,
        }
    }

    #[test]
    fn test_phase_sync_request_shape() {
        let kind = ExchangeKind::PhaseSync {
            tag: PhaseTag::new(Phase::DayOpened, time()),
        };
        let msg = kind.build_request(17, time());
        assert_eq!(msg.verb, Verb::Post);
        assert_eq!(msg.msg_type.as_deref(), Some("phase"));
        assert_eq!(msg.value.as_deref(), Some("DayOpened"));
        assert_eq!(msg.numeric_id(), Some(17));
        assert_eq!(msg.tag.as_deref(), Some("4"));
    }

    #[test]
    fn test_order_decision_request_carries_order() {
        let order = Order {
            id: 99,
            owner: ParticipantId::from("t1"),
            operator: ParticipantId::from("m1"),
            side: OrderSide::Ask,
            price: Price::new(dec!(12.5)),
            quantity: 3,
            day: 4,
        };
        let msg = ExchangeKind::OrderDecision { order }.build_request(5, time());
        assert_eq!(msg.msg_type.as_deref(), Some("order"));
        assert_eq!(msg.value.as_deref(), Some("99,ask,12.5,3"));
    }
}
