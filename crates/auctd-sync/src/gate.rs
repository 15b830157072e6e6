//! Countdown barrier with a bounded wait.
//!
//! The Phase Clock arms the gate with a phase tag and the set of
//! participants expected to acknowledge, then waits up to a bound.
//! Acknowledgments arrive concurrently from session tasks; the first one
//! to empty the expected set releases the waiter. A timed-out wait is
//! reported, never raised: the clock proceeds regardless.

use auctd_core::{ParticipantId, PhaseTag};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Result of one bounded gate wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    /// Whether every expected acknowledgment arrived before the bound.
    pub satisfied: bool,
    /// Participants that had not acknowledged when the wait ended.
    pub missing: Vec<ParticipantId>,
}

struct GateInner {
    tag: Option<PhaseTag>,
    /// Arming generation; decrements against an older generation are stale.
    generation: u64,
    remaining: HashSet<ParticipantId>,
    released: bool,
}

/// A reusable soft barrier keyed by a phase tag.
///
/// Each `arm` starts a fresh gate instance; an instance releases exactly
/// once, either when the expected set empties or when the bounded wait
/// expires.
pub struct SyncGate {
    inner: Mutex<GateInner>,
    notify: Notify,
}

impl SyncGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                tag: None,
                generation: 0,
                remaining: HashSet::new(),
                released: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Arm the gate for one phase transition.
    ///
    /// An empty expected set arms an already-satisfied gate: the next
    /// `await_up_to` returns immediately.
    pub fn arm(&self, tag: PhaseTag, expected: impl IntoIterator<Item = ParticipantId>) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.remaining = expected.into_iter().collect();
        inner.released = inner.remaining.is_empty();
        debug!(tag = %tag, required = inner.remaining.len(), "Gate armed");
        inner.tag = Some(tag);
    }

    /// Record one acknowledgment.
    ///
    /// Returns true iff the acknowledgment counted against the currently
    /// armed tag. A mismatched tag (stale ack for an earlier transition),
    /// an unknown participant or a duplicate are all ignored.
    pub fn acknowledge(&self, tag: &PhaseTag, participant: &ParticipantId) -> bool {
        let mut inner = self.inner.lock();
        if inner.tag.as_ref() != Some(tag) {
            debug!(tag = %tag, participant = %participant, "Stale gate acknowledgment dropped");
            return false;
        }
        if !inner.remaining.remove(participant) {
            return false;
        }
        if inner.remaining.is_empty() && !inner.released {
            inner.released = true;
            self.notify.notify_waiters();
        }
        true
    }

    /// The currently armed tag, if any.
    #[must_use]
    pub fn current_tag(&self) -> Option<PhaseTag> {
        self.inner.lock().tag.clone()
    }

    fn snapshot(&self) -> GateOutcome {
        let inner = self.inner.lock();
        GateOutcome {
            satisfied: inner.released,
            missing: inner.remaining.iter().cloned().collect(),
        }
    }

    /// Wait for the gate to release, up to `bound`.
    ///
    /// Always returns; a partial or empty acknowledgment count at expiry
    /// is reported in the outcome, not raised.
    pub async fn await_up_to(&self, bound: Duration) -> GateOutcome {
        let generation = self.inner.lock().generation;
        let deadline = Instant::now() + bound;
        loop {
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock();
                if inner.generation != generation || inner.released {
                    break;
                }
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            if tokio::time::timeout(left, notified).await.is_err() {
                break;
            }
        }
        self.snapshot()
    }
}

impl Default for SyncGate {
    fn default() -> Self {
        Self::new()
    }
}
