//! Market domain objects: orders, settlements and fee schedules.
//!
//! Prices use `rust_decimal` for exact decimal arithmetic; mixing up
//! floating-point money would corrupt fee accounting.

use crate::identity::ParticipantId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Price with exact decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(pub Decimal);

impl Price {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    #[must_use]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Price {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s).map(Self)
    }
}

/// Order side: a bid buys, an ask sells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Bid,
    Ask,
}

impl OrderSide {
    /// Returns the opposite side.
    #[must_use]
    pub fn opposite(&self) -> Self {
        match self {
            Self::Bid => Self::Ask,
            Self::Ask => Self::Bid,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bid => write!(f, "bid"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bid" => Ok(Self::Bid),
            "ask" => Ok(Self::Ask),
            other => Err(crate::CoreError::InvalidOrder(format!(
                "unknown order side: {other}"
            ))),
        }
    }
}

/// A single order submitted by a trader to a market operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Server-allocated id, unique across the process lifetime.
    pub id: u64,
    /// Submitting trader.
    pub owner: ParticipantId,
    /// Market operator whose market this order targets.
    pub operator: ParticipantId,
    pub side: OrderSide,
    pub price: Price,
    pub quantity: u32,
    /// Day index the order was placed on; orders do not survive the day.
    pub day: u32,
}

/// A settlement pairing one ask with one bid, struck by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: u64,
    /// Operator that cleared the pair.
    pub operator: ParticipantId,
    pub ask_id: u64,
    pub bid_id: u64,
    pub price: Price,
    pub day: u32,
}

/// The fee vector a market operator posts at day opening.
///
/// Field order matches the wire encoding: a comma-separated list of the
/// five levels in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Flat fee charged at registration with the market.
    pub registration: Price,
    /// Flat fee for market information subscriptions.
    pub information: Price,
    /// Flat fee per submitted order.
    pub order: Price,
    /// Flat fee per executed settlement.
    pub settlement: Price,
    /// Fraction of trade profit taken by the operator (0..=1).
    pub profit_share: Price,
}

impl FeeSchedule {
    /// A zero-fee schedule.
    #[must_use]
    pub fn free() -> Self {
        Self {
            registration: Price::ZERO,
            information: Price::ZERO,
            order: Price::ZERO,
            settlement: Price::ZERO,
            profit_share: Price::ZERO,
        }
    }

    /// Iterate the five levels in wire order.
    pub fn levels(&self) -> [Price; 5] {
        [
            self.registration,
            self.information,
            self.order,
            self.settlement,
            self.profit_share,
        ]
    }

    /// Wire encoding: comma-separated levels.
    #[must_use]
    pub fn wire_encode(&self) -> String {
        self.levels()
            .iter()
            .map(Price::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the wire encoding produced by `wire_encode`.
    pub fn wire_decode(s: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 5 {
            return Err(crate::CoreError::InvalidPrice(format!(
                "fee schedule needs 5 levels, got {}",
                parts.len()
            )));
        }
        let mut levels = [Price::ZERO; 5];
        for (slot, part) in levels.iter_mut().zip(&parts) {
            *slot = part.parse()?;
        }
        Ok(Self {
            registration: levels[0],
            information: levels[1],
            order: levels[2],
            settlement: levels[3],
            profit_share: levels[4],
        })
    }
}
