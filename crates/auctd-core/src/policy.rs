//! Collaborator interfaces consumed by the protocol core.
//!
//! The economic side of the simulation (what fees are acceptable, what
//! orders are sane, when misbehavior is punished) is pluggable. The core
//! calls these traits through narrow interfaces and never depends on the
//! strategy internals.

use crate::identity::ParticipantId;
use crate::order::{FeeSchedule, Order, Price, Settlement};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// How a rejection maps onto the wire response taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionSeverity {
    /// Well-formed but rejected: answered INVALID, session recovers.
    Invalid,
    /// Malformed or invariant-violating: answered ERROR.
    Error,
}

/// Ruling of a charge policy over a proposed fee schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum FeeRuling {
    /// Accepted as proposed.
    Pass,
    /// Accepted after adjustment; the adjusted vector is authoritative.
    Clamp(FeeSchedule),
    /// Rejected outright; the operator is banned for the day.
    Reject(String),
}

/// Validates fee schedules proposed by market operators.
#[cfg_attr(test, mockall::automock)]
pub trait ChargePolicy: Send + Sync {
    /// Evaluate a proposed fee vector.
    fn evaluate(&self, proposed: &FeeSchedule) -> FeeRuling;
}

/// Typed rejection raised by an order validator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrderRejection {
    #[error("price {price} outside [{min}, {max}]")]
    PriceOutOfBounds {
        price: Price,
        min: Price,
        max: Price,
    },
    #[error("quantity {quantity} outside 1..={max}")]
    QuantityOutOfBounds { quantity: u32, max: u32 },
    #[error("order is not well-formed: {0}")]
    Malformed(String),
}

impl OrderRejection {
    /// How the core answers this rejection on the wire.
    #[must_use]
    pub fn severity(&self) -> RejectionSeverity {
        match self {
            Self::PriceOutOfBounds { .. } | Self::QuantityOutOfBounds { .. } => {
                RejectionSeverity::Invalid
            }
            Self::Malformed(_) => RejectionSeverity::Error,
        }
    }
}

/// Validates orders before they are forwarded to a market operator.
#[cfg_attr(test, mockall::automock)]
pub trait OrderValidator: Send + Sync {
    fn validate(&self, order: &Order) -> Result<(), OrderRejection>;
}

/// Typed rejection raised by a settlement validator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettlementRejection {
    #[error("settlement price {price} not between bid {bid} and ask {ask}")]
    PriceOutsideSpread { price: Price, ask: Price, bid: Price },
    #[error("settlement references unknown order {0}")]
    UnknownOrder(u64),
    #[error("settlement pairs two {0} orders")]
    SameSide(crate::OrderSide),
}

impl SettlementRejection {
    #[must_use]
    pub fn severity(&self) -> RejectionSeverity {
        match self {
            Self::PriceOutsideSpread { .. } => RejectionSeverity::Invalid,
            Self::UnknownOrder(_) | Self::SameSide(_) => RejectionSeverity::Error,
        }
    }
}

/// Validates settlements struck by market operators.
#[cfg_attr(test, mockall::automock)]
pub trait SettlementValidator: Send + Sync {
    fn validate(
        &self,
        settlement: &Settlement,
        ask: &Order,
        bid: &Order,
    ) -> Result<(), SettlementRejection>;
}

/// Kinds of recorded protocol misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorKind {
    /// Message legal nowhere in the current grammar.
    WrongPhaseMessage,
    /// Second concurrent order exchange for the same order id.
    DuplicateOrder,
    /// Message that could not be parsed or violated a protocol invariant.
    MalformedMessage,
    /// Reconnection attempts past the configured limit.
    ExcessiveReconnect,
    /// Fee schedule rejected by the charge policy.
    FeeViolation,
}

impl fmt::Display for BehaviorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WrongPhaseMessage => "wrong_phase_message",
            Self::DuplicateOrder => "duplicate_order",
            Self::MalformedMessage => "malformed_message",
            Self::ExcessiveReconnect => "excessive_reconnect",
            Self::FeeViolation => "fee_violation",
        };
        write!(f, "{name}")
    }
}

/// Penalties a behavior controller may hold pending against a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyKind {
    /// Excluded from the current day's market activity.
    DayBan,
    /// Connection refused / dropped.
    Disconnect,
}

/// Accumulates behavior violations and decides penalties.
///
/// The core consults this before honoring a reconnection or accepting a
/// fee submission, and reports back once a pending penalty has been
/// applied.
#[cfg_attr(test, mockall::automock)]
pub trait BehaviorController: Send + Sync {
    /// Record one observed violation.
    fn observe(&self, participant: &ParticipantId, kind: BehaviorKind);

    /// Whether a penalty of the given kind is pending for the participant.
    fn pending_penalty(&self, participant: &ParticipantId, kind: PenaltyKind) -> bool;

    /// Acknowledge that a pending penalty has been applied.
    fn penalty_executed(&self, participant: &ParticipantId, kind: PenaltyKind);
}

// ============================================================================
// Default implementations
// ============================================================================

/// Charge policy that checks every fee level against a closed interval.
///
/// `reject_out_of_bounds` selects the configured enforcement: a hard
/// rejection (day ban) or a silent clamp into bounds.
#[derive(Debug, Clone)]
pub struct BoundedChargePolicy {
    pub min: Price,
    pub max: Price,
    pub reject_out_of_bounds: bool,
}

impl BoundedChargePolicy {
    #[must_use]
    pub fn new(min: Price, max: Price, reject_out_of_bounds: bool) -> Self {
        Self {
            min,
            max,
            reject_out_of_bounds,
        }
    }

    fn clamp_level(&self, level: Price) -> Price {
        Price::new(level.inner().clamp(self.min.inner(), self.max.inner()))
    }
}

impl ChargePolicy for BoundedChargePolicy {
    fn evaluate(&self, proposed: &FeeSchedule) -> FeeRuling {
        let in_bounds = |p: Price| p >= self.min && p <= self.max;
        if proposed.levels().iter().all(|l| in_bounds(*l)) {
            return FeeRuling::Pass;
        }
        if self.reject_out_of_bounds {
            return FeeRuling::Reject(format!(
                "fee levels outside [{}, {}]",
                self.min, self.max
            ));
        }
        FeeRuling::Clamp(FeeSchedule {
            registration: self.clamp_level(proposed.registration),
            information: self.clamp_level(proposed.information),
            order: self.clamp_level(proposed.order),
            settlement: self.clamp_level(proposed.settlement),
            profit_share: self.clamp_level(proposed.profit_share),
        })
    }
}

/// Order validator enforcing price and quantity bounds.
#[derive(Debug, Clone)]
pub struct BoundsOrderValidator {
    pub min_price: Price,
    pub max_price: Price,
    pub max_quantity: u32,
}

impl OrderValidator for BoundsOrderValidator {
    fn validate(&self, order: &Order) -> Result<(), OrderRejection> {
        if order.quantity == 0 || order.quantity > self.max_quantity {
            return Err(OrderRejection::QuantityOutOfBounds {
                quantity: order.quantity,
                max: self.max_quantity,
            });
        }
        if order.price < self.min_price || order.price > self.max_price {
            return Err(OrderRejection::PriceOutOfBounds {
                price: order.price,
                min: self.min_price,
                max: self.max_price,
            });
        }
        Ok(())
    }
}

/// Settlement validator requiring the strike price to sit inside the
/// bid/ask spread and the pair to be one ask against one bid.
#[derive(Debug, Clone, Default)]
pub struct BoundsSettlementValidator;

impl SettlementValidator for BoundsSettlementValidator {
    fn validate(
        &self,
        settlement: &Settlement,
        ask: &Order,
        bid: &Order,
    ) -> Result<(), SettlementRejection> {
        if ask.side == bid.side {
            return Err(SettlementRejection::SameSide(ask.side));
        }
        if settlement.price < ask.price || settlement.price > bid.price {
            return Err(SettlementRejection::PriceOutsideSpread {
                price: settlement.price,
                ask: ask.price,
                bid: bid.price,
            });
        }
        Ok(())
    }
}

/// Behavior controller that counts violations per participant and holds a
/// penalty pending once a kind's threshold is crossed.
pub struct ThresholdBehaviorController {
    thresholds: HashMap<BehaviorKind, u32>,
    counts: DashMap<(ParticipantId, BehaviorKind), u32>,
    pending: DashMap<(ParticipantId, PenaltyKind), ()>,
}

impl ThresholdBehaviorController {
    #[must_use]
    pub fn new(thresholds: HashMap<BehaviorKind, u32>) -> Self {
        Self {
            thresholds,
            counts: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Current violation count for one participant/kind pair.
    #[must_use]
    pub fn count(&self, participant: &ParticipantId, kind: BehaviorKind) -> u32 {
        self.counts
            .get(&(participant.clone(), kind))
            .map(|c| *c)
            .unwrap_or(0)
    }

    fn penalty_for(kind: BehaviorKind) -> PenaltyKind {
        match kind {
            BehaviorKind::ExcessiveReconnect => PenaltyKind::Disconnect,
            _ => PenaltyKind::DayBan,
        }
    }
}

impl BehaviorController for ThresholdBehaviorController {
    fn observe(&self, participant: &ParticipantId, kind: BehaviorKind) {
        let mut entry = self
            .counts
            .entry((participant.clone(), kind))
            .or_insert(0);
        *entry += 1;
        let count = *entry;
        drop(entry);

        if let Some(&threshold) = self.thresholds.get(&kind) {
            if count >= threshold {
                tracing::warn!(
                    participant = %participant,
                    kind = %kind,
                    count,
                    threshold,
                    "Behavior threshold crossed, penalty pending"
                );
                self.pending
                    .insert((participant.clone(), Self::penalty_for(kind)), ());
            }
        }
    }

    fn pending_penalty(&self, participant: &ParticipantId, kind: PenaltyKind) -> bool {
        self.pending.contains_key(&(participant.clone(), kind))
    }

    fn penalty_executed(&self, participant: &ParticipantId, kind: PenaltyKind) {
        self.pending.remove(&(participant.clone(), kind));
        // Counts restart after a penalty is served.
        self.counts
            .retain(|(p, k), _| p != participant || Self::penalty_for(*k) != kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderSide;
    use rust_decimal_macros::dec;

    fn price(v: rust_decimal::Decimal) -> Price {
        Price::new(v)
    }

    fn sample_order(side: OrderSide, p: rust_decimal::Decimal) -> Order {
        Order {
            id: 1,
            owner: ParticipantId::from("t1"),
            operator: ParticipantId::from("m1"),
            side,
            price: price(p),
            quantity: 1,
            day: 0,
        }
    }

    #[test]
    fn test_bounded_policy_pass() {
        let policy = BoundedChargePolicy::new(price(dec!(0)), price(dec!(10)), true);
        let ruling = policy.evaluate(&FeeSchedule::free());
        assert_eq!(ruling, FeeRuling::Pass);
    }

    #[test]
    fn test_bounded_policy_reject() {
        let policy = BoundedChargePolicy::new(price(dec!(0)), price(dec!(10)), true);
        let mut fees = FeeSchedule::free();
        fees.registration = price(dec!(11));
        assert!(matches!(policy.evaluate(&fees), FeeRuling::Reject(_)));
    }

    #[test]
    fn test_bounded_policy_clamp() {
        let policy = BoundedChargePolicy::new(price(dec!(0)), price(dec!(10)), false);
        let mut fees = FeeSchedule::free();
        fees.order = price(dec!(25));
        match policy.evaluate(&fees) {
            FeeRuling::Clamp(adjusted) => {
                assert_eq!(adjusted.order, price(dec!(10)));
                assert_eq!(adjusted.registration, Price::ZERO);
            }
            other => panic!("expected clamp, got {other:?}"),
        }
    }

    #[test]
    fn test_order_validator_bounds() {
        let validator = BoundsOrderValidator {
            min_price: price(dec!(1)),
            max_price: price(dec!(100)),
            max_quantity: 10,
        };

        assert!(validator
            .validate(&sample_order(OrderSide::Bid, dec!(50)))
            .is_ok());

        let err = validator
            .validate(&sample_order(OrderSide::Bid, dec!(500)))
            .unwrap_err();
        assert_eq!(err.severity(), RejectionSeverity::Invalid);

        let mut zero_qty = sample_order(OrderSide::Ask, dec!(50));
        zero_qty.quantity = 0;
        assert!(validator.validate(&zero_qty).is_err());
    }

    #[test]
    fn test_settlement_validator_spread() {
        let validator = BoundsSettlementValidator;
        let ask = sample_order(OrderSide::Ask, dec!(10));
        let bid = sample_order(OrderSide::Bid, dec!(20));
        let settlement = Settlement {
            id: 1,
            operator: ParticipantId::from("m1"),
            ask_id: ask.id,
            bid_id: bid.id,
            price: price(dec!(15)),
            day: 0,
        };
        assert!(validator.validate(&settlement, &ask, &bid).is_ok());

        let outside = Settlement {
            price: price(dec!(25)),
            ..settlement
        };
        let err = validator.validate(&outside, &ask, &bid).unwrap_err();
        assert_eq!(err.severity(), RejectionSeverity::Invalid);
    }

    #[test]
    fn test_settlement_validator_same_side() {
        let validator = BoundsSettlementValidator;
        let ask_a = sample_order(OrderSide::Ask, dec!(10));
        let ask_b = sample_order(OrderSide::Ask, dec!(12));
        let settlement = Settlement {
            id: 1,
            operator: ParticipantId::from("m1"),
            ask_id: ask_a.id,
            bid_id: ask_b.id,
            price: price(dec!(11)),
            day: 0,
        };
        let err = validator.validate(&settlement, &ask_a, &ask_b).unwrap_err();
        assert_eq!(err.severity(), RejectionSeverity::Error);
    }

    #[test]
    fn test_threshold_controller_accumulates() {
        let controller = ThresholdBehaviorController::new(HashMap::from([(
            BehaviorKind::WrongPhaseMessage,
            3,
        )]));
        let p = ParticipantId::from("t1");

        controller.observe(&p, BehaviorKind::WrongPhaseMessage);
        controller.observe(&p, BehaviorKind::WrongPhaseMessage);
        assert!(!controller.pending_penalty(&p, PenaltyKind::DayBan));

        controller.observe(&p, BehaviorKind::WrongPhaseMessage);
        assert!(controller.pending_penalty(&p, PenaltyKind::DayBan));

        controller.penalty_executed(&p, PenaltyKind::DayBan);
        assert!(!controller.pending_penalty(&p, PenaltyKind::DayBan));
        assert_eq!(controller.count(&p, BehaviorKind::WrongPhaseMessage), 0);
    }

    #[test]
    fn test_unthresholded_kind_never_pends() {
        let controller = ThresholdBehaviorController::new(HashMap::new());
        let p = ParticipantId::from("t1");
        for _ in 0..100 {
            controller.observe(&p, BehaviorKind::DuplicateOrder);
        }
        assert!(!controller.pending_penalty(&p, PenaltyKind::DayBan));
    }
}
