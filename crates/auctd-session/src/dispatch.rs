//! The fan-out dispatcher.
//!
//! Routes phase events and cross-session notifications into target
//! sessions with two guarantees: event-class tasks enqueued so far drain
//! before any later-enqueued message-class task, and same-class tasks
//! drain in global enqueue order. Multi-receiver events shuffle their
//! receiver set independently per event so no participant is structurally
//! first.
//!
//! Synchronous mode drains the queue inline at enqueue; asynchronous mode
//! wakes a dedicated worker. Both share the queue and the ordering
//! comparator; only the draining trigger differs.

use crate::error::SessionError;
use crate::events::EngineEvent;
use crate::registry::ConnectionRegistry;
use auctd_core::ParticipantId;
use auctd_wire::Message;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Draining trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Drain inline at enqueue. Deterministic offline runs.
    Synchronous,
    /// A dedicated worker drains the queue. Real-time play.
    Asynchronous,
}

/// Why a delivery failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchFailure {
    /// Target identity not bound in the registry.
    UnknownTarget,
    /// Target session already reached CONN_CLOSED.
    SessionClosed,
    /// The target session rejected the delivery.
    DeliveryFailed(String),
}

/// Callback invoked when a delivery fails; runs at drain time.
pub type FailureCallback = Box<dyn FnOnce(&ParticipantId, &DispatchFailure) + Send>;

/// Payload of one delivery task.
pub enum Delivery {
    /// Event-class: mutates target session state.
    Event(EngineEvent),
    /// Message-class: forwarded to the target's remote participant.
    Direct(Message),
}

impl Delivery {
    fn class_rank(&self) -> u8 {
        match self {
            Self::Event(_) => 0,
            Self::Direct(_) => 1,
        }
    }
}

struct Task {
    class: u8,
    seq: u64,
    target: ParticipantId,
    delivery: Delivery,
    on_failure: Option<FailureCallback>,
}

impl Task {
    fn key(&self) -> (u8, u64) {
        (self.class, self.seq)
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest (class, seq)
        // key drains first.
        other.key().cmp(&self.key())
    }
}

/// Fan-out dispatcher shared by the clock and all sessions.
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    mode: DeliveryMode,
    queue: Mutex<BinaryHeap<Task>>,
    seq: AtomicU64,
    draining: AtomicBool,
    notify: Notify,
}

impl Dispatcher {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, mode: DeliveryMode) -> Self {
        Self {
            registry,
            mode,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Deliver an event to one session.
    pub fn emit_event(
        &self,
        target: ParticipantId,
        event: EngineEvent,
        on_failure: Option<FailureCallback>,
    ) {
        self.enqueue(target, Delivery::Event(event), on_failure);
    }

    /// Deliver one event to many sessions.
    ///
    /// The receiver order is shuffled independently per call; failures
    /// are logged but not reported (phase fan-out is best-effort).
    pub fn broadcast_event(&self, mut targets: Vec<ParticipantId>, event: EngineEvent) {
        targets.shuffle(&mut rand::thread_rng());
        debug!(event = event.label(), receivers = targets.len(), "Broadcasting event");
        for target in targets {
            self.enqueue(target, Delivery::Event(event.clone()), None);
        }
    }

    /// Forward a wire message to one session's remote participant.
    pub fn send_message(
        &self,
        target: ParticipantId,
        message: Message,
        on_failure: Option<FailureCallback>,
    ) {
        self.enqueue(target, Delivery::Direct(message), on_failure);
    }

    /// Forward one wire message to many sessions' remotes, shuffled.
    pub fn broadcast_message(&self, mut targets: Vec<ParticipantId>, message: Message) {
        targets.shuffle(&mut rand::thread_rng());
        for target in targets {
            self.enqueue(target, Delivery::Direct(message.clone()), None);
        }
    }

    fn enqueue(
        &self,
        target: ParticipantId,
        delivery: Delivery,
        on_failure: Option<FailureCallback>,
    ) {
        let task = Task {
            class: delivery.class_rank(),
            seq: self.seq.fetch_add(1, AtomicOrdering::SeqCst),
            target,
            delivery,
            on_failure,
        };
        self.queue.lock().push(task);
        match self.mode {
            DeliveryMode::Synchronous => self.drain(),
            DeliveryMode::Asynchronous => self.notify.notify_one(),
        }
    }

    /// Drain the queue until empty.
    ///
    /// Deliveries can enqueue further tasks; the re-entrancy guard keeps
    /// a single drainer active while nested enqueues fall through to it.
    pub fn drain(&self) {
        if self.draining.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        loop {
            let task = self.queue.lock().pop();
            match task {
                Some(task) => self.deliver(task),
                None => {
                    self.draining.store(false, AtomicOrdering::SeqCst);
                    // A racing enqueue may have landed between the empty
                    // pop and clearing the flag; reclaim if so.
                    if self.queue.lock().is_empty()
                        || self.draining.swap(true, AtomicOrdering::SeqCst)
                    {
                        break;
                    }
                }
            }
        }
    }

    /// Worker loop for asynchronous mode.
    pub async fn run_worker(&self, shutdown: CancellationToken) {
        info!("Dispatcher worker started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    self.drain();
                    info!("Dispatcher worker stopped");
                    return;
                }
                () = self.notify.notified() => {
                    self.drain();
                }
            }
        }
    }

    fn deliver(&self, task: Task) {
        let Task {
            target,
            delivery,
            on_failure,
            ..
        } = task;

        let failure = match self.registry.get(&target) {
            None => Some(DispatchFailure::UnknownTarget),
            Some(session) if !session.client_state().is_live() => {
                Some(DispatchFailure::SessionClosed)
            }
            Some(session) => {
                let result = match delivery {
                    Delivery::Event(event) => session.handle_event(event),
                    Delivery::Direct(message) => session.forward_to_remote(message),
                };
                match result {
                    Ok(()) => None,
                    Err(SessionError::SessionClosed(_)) => Some(DispatchFailure::SessionClosed),
                    Err(e) => Some(DispatchFailure::DeliveryFailed(e.to_string())),
                }
            }
        };

        if let Some(failure) = failure {
            warn!(target = %target, ?failure, "Delivery failed");
            if let Some(cb) = on_failure {
                cb(&target, &failure);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{drain, Harness};
    use auctd_core::{GameTime, Phase, Role};
    use auctd_wire::{Message, Verb};

    fn phase_event(phase: Phase) -> EngineEvent {
        EngineEvent::PhaseBegun {
            phase,
            time: GameTime::default(),
        }
    }

    #[tokio::test]
    async fn test_events_drain_before_later_messages() {
        // Asynchronous mode queues without draining, so the comparator's
        // order is observable once drain() runs.
        let h = Harness::with_mode(DeliveryMode::Asynchronous);
        let (session, mut rx) = h.connect();
        let id = h.register(&session, &mut rx, Role::Buyer, "b1");

        h.dispatcher.send_message(
            id.clone(),
            Message::new(Verb::Post).with_type("notice-a"),
            None,
        );
        h.dispatcher
            .emit_event(id.clone(), phase_event(Phase::DayOpening), None);
        h.dispatcher.send_message(
            id.clone(),
            Message::new(Verb::Post).with_type("notice-b"),
            None,
        );
        h.dispatcher
            .emit_event(id.clone(), phase_event(Phase::DayOpened), None);

        assert!(rx.try_recv().is_err(), "nothing drains before the worker");
        h.dispatcher.drain();

        // Phase events produce phase notices at delivery time, so the
        // remote sees both events' output before either queued message.
        let kinds: Vec<Option<String>> =
            drain(&mut rx).into_iter().map(|m| m.msg_type).collect();
        assert_eq!(
            kinds,
            vec![
                Some("phase".to_string()),
                Some("phase".to_string()),
                Some("notice-a".to_string()),
                Some("notice-b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_same_class_preserves_enqueue_order() {
        let h = Harness::with_mode(DeliveryMode::Asynchronous);
        let (session, mut rx) = h.connect();
        let id = h.register(&session, &mut rx, Role::Buyer, "b1");

        for n in 0..5 {
            h.dispatcher.send_message(
                id.clone(),
                Message::new(Verb::Post).with_type("n").with_value(n.to_string()),
                None,
            );
        }
        h.dispatcher.drain();

        let values: Vec<Option<String>> = drain(&mut rx).into_iter().map(|m| m.value).collect();
        assert_eq!(
            values,
            (0..5).map(|n| Some(n.to_string())).collect::<Vec<_>>()
        );
        let _ = session;
    }

    #[tokio::test]
    async fn test_failure_reported_to_caller() {
        let h = Harness::new();
        let (reported_tx, mut reported_rx) = tokio::sync::mpsc::unbounded_channel();

        let on_failure: FailureCallback = Box::new(move |target, failure| {
            let _ = reported_tx.send((target.clone(), failure.clone()));
        });
        h.dispatcher.send_message(
            auctd_core::ParticipantId::from("nobody"),
            Message::new(Verb::Post),
            Some(on_failure),
        );

        let (target, failure) = reported_rx.try_recv().unwrap();
        assert_eq!(target.as_str(), "nobody");
        assert_eq!(failure, DispatchFailure::UnknownTarget);
    }

    #[tokio::test]
    async fn test_closed_session_gets_no_delivery() {
        let h = Harness::new();
        let (session, mut rx) = h.connect();
        let id = h.register(&session, &mut rx, Role::Buyer, "b1");
        session.close("test");
        // Unbound at close: the dispatcher reports unknown target.
        let (reported_tx, mut reported_rx) = tokio::sync::mpsc::unbounded_channel();
        let on_failure: FailureCallback = Box::new(move |_, failure| {
            let _ = reported_tx.send(failure.clone());
        });
        h.dispatcher
            .send_message(id, Message::new(Verb::Post), Some(on_failure));

        assert_eq!(reported_rx.try_recv().unwrap(), DispatchFailure::UnknownTarget);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_receiver() {
        let h = Harness::new();
        let mut remotes = Vec::new();
        for n in 0..5 {
            let (session, mut rx) = h.connect();
            h.register(&session, &mut rx, Role::Buyer, &format!("b{n}"));
            remotes.push((session, rx));
        }

        h.dispatcher
            .broadcast_message(h.registry.active(), Message::new(Verb::Post).with_type("hello"));

        for (_, rx) in &mut remotes {
            let msg = rx.try_recv().unwrap();
            assert_eq!(msg.msg_type.as_deref(), Some("hello"));
        }
    }
}
