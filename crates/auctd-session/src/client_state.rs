//! The per-connection failure-severity ladder.

use std::fmt;

/// Connection state, ordered by severity.
///
/// Transitions are monotonic non-decreasing with one exception: `Ok` may
/// follow `Error` (recovery on the next successful exchange). `Fatal`
/// always forces an automatic transition to `ConnClosed`, and
/// `ConnClosed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connection accepted, identification not yet complete.
    Ready,
    /// Identified and healthy.
    Ok,
    /// Recoverable failure observed.
    Error,
    /// Unrecoverable failure; the session is about to close.
    Fatal,
    /// Terminal. No further transitions are processed.
    ConnClosed,
}

impl ClientState {
    /// Severity rank used for the monotonicity invariant.
    #[must_use]
    pub fn severity(&self) -> u8 {
        match self {
            Self::Ready => 0,
            Self::Ok => 1,
            Self::Error => 2,
            Self::Fatal => 3,
            Self::ConnClosed => 4,
        }
    }

    /// Whether a transition to `next` is permitted.
    #[must_use]
    pub fn can_transition(&self, next: ClientState) -> bool {
        if *self == Self::ConnClosed {
            return false;
        }
        if *self == Self::Error && next == Self::Ok {
            // Recovery path.
            return true;
        }
        next.severity() >= self.severity()
    }

    /// Whether the session still processes traffic.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Fatal | Self::ConnClosed)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "READY",
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::ConnClosed => "CONN_CLOSED",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(ClientState::Ready.can_transition(ClientState::Ok));
        assert!(ClientState::Ok.can_transition(ClientState::Error));
        assert!(ClientState::Error.can_transition(ClientState::Fatal));
        assert!(ClientState::Fatal.can_transition(ClientState::ConnClosed));
    }

    #[test]
    fn test_recovery_from_error() {
        assert!(ClientState::Error.can_transition(ClientState::Ok));
    }

    #[test]
    fn test_no_backward_from_fatal() {
        assert!(!ClientState::Fatal.can_transition(ClientState::Ok));
        assert!(!ClientState::Fatal.can_transition(ClientState::Error));
        assert!(!ClientState::Fatal.can_transition(ClientState::Ready));
    }

    #[test]
    fn test_conn_closed_absorbing() {
        for next in [
            ClientState::Ready,
            ClientState::Ok,
            ClientState::Error,
            ClientState::Fatal,
            ClientState::ConnClosed,
        ] {
            assert!(!ClientState::ConnClosed.can_transition(next));
        }
    }
}
