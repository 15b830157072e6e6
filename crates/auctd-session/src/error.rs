//! Error taxonomy for the session layer.
//!
//! The variants mirror how failures propagate: protocol violations and
//! invalid content stay contained to a response, transport failures and
//! exchange timeouts escalate the owning session, gate timeouts are only
//! logged by the clock.

use auctd_core::{BehaviorKind, ParticipantId};
use thiserror::Error;

/// Session error types.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Message illegal for the current phase. Recorded, not fatal.
    #[error("Protocol violation by {participant}: {kind}")]
    ProtocolViolation {
        participant: ParticipantId,
        kind: BehaviorKind,
    },

    /// Well-formed but rejected by a validator.
    #[error("Invalid content: {0}")]
    ContentInvalid(String),

    /// Send or connection error. Escalates the owning session.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A pending exchange's bounded wait expired.
    #[error("Exchange {exchange_id} timed out")]
    SynchronizationTimeout { exchange_id: u64 },

    /// Accumulated violations or reconnects past the threshold.
    #[error("Behavior limit exceeded for {0}")]
    BehaviorLimitExceeded(ParticipantId),

    /// The target of a dispatch is not registered.
    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    /// The target session already reached CONN_CLOSED.
    #[error("Session for {0} is closed")]
    SessionClosed(ParticipantId),

    /// A second session claimed an identity that is still connected.
    #[error("Identity {0} is already connected")]
    IdentityInUse(ParticipantId),
}

/// Result type alias for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;
