//! Participant identity and the identity office.
//!
//! A `ParticipantId` is an opaque string, unique per connected entity.
//! It is assigned either by the remote party at registration (if unclaimed)
//! or generated by the server, and is immutable once assigned. It is the
//! dispatcher's routing key and the Connection Registry's primary key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Opaque participant identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Wrap a client-claimed identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Participant classification.
///
/// Traders (buyers and sellers) submit orders; operators own markets,
/// post fee schedules and decide order admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Buyer,
    Seller,
    Operator,
}

impl Role {
    /// Whether this role submits orders.
    #[must_use]
    pub fn is_trader(&self) -> bool {
        matches!(self, Self::Buyer | Self::Seller)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buyer => write!(f, "buyer"),
            Self::Seller => write!(f, "seller"),
            Self::Operator => write!(f, "operator"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buyer" => Ok(Self::Buyer),
            "seller" => Ok(Self::Seller),
            "operator" => Ok(Self::Operator),
            other => Err(crate::CoreError::InvalidIdentity(format!(
                "unknown role: {other}"
            ))),
        }
    }
}

/// Allocates unique identifiers for participants and in-flight
/// orders/settlements.
///
/// Participant identities are uuid-based; order and settlement ids are
/// process-unique monotone counters, which keeps correlation ids compact
/// on the wire.
#[derive(Debug, Default)]
pub struct IdentityOffice {
    next_order_id: AtomicU64,
    next_settlement_id: AtomicU64,
}

impl IdentityOffice {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_order_id: AtomicU64::new(1),
            next_settlement_id: AtomicU64::new(1),
        }
    }

    /// Generate a fresh server-assigned participant identity.
    #[must_use]
    pub fn participant_id(&self, role: Role) -> ParticipantId {
        let short = &Uuid::new_v4().simple().to_string()[..12];
        ParticipantId(format!("{role}_{short}"))
    }

    /// Allocate the next order id.
    #[must_use]
    pub fn order_id(&self) -> u64 {
        self.next_order_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next settlement id.
    #[must_use]
    pub fn settlement_id(&self) -> u64 {
        self.next_settlement_id.fetch_add(1, Ordering::SeqCst)
    }
}
