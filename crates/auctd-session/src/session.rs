//! The per-connection protocol session machine.
//!
//! One `Session` exists per accepted connection. It enforces which
//! message shapes are legal in the current phase, pairs proactive
//! requests with their asynchronous responses, parks cross-session
//! exchanges until the owning operator decides, and converges failures
//! through the READY → OK ⇄ ERROR → FATAL → CONN_CLOSED ladder.
//!
//! Locking: all mutable state sits behind one mutex per session. The
//! dispatcher is never invoked while that mutex is held; in synchronous
//! mode a dispatch drains inline and may re-enter another session, so
//! processing collects effects under the lock and applies them after.

use crate::client_state::ClientState;
use crate::dispatch::{Dispatcher, FailureCallback};
use crate::error::{SessionError, SessionResult};
use crate::events::EngineEvent;
use crate::exchange::{ExchangeKind, PendingExchange};
use crate::grammar::ReactiveGrammar;
use crate::registry::ConnectionRegistry;
use auctd_core::{
    BehaviorController, BehaviorKind, ChargePolicy, FeeRuling, FeeSchedule, GameTime,
    IdentityOffice, Order, OrderSide, OrderValidator, ParticipantId, PenaltyKind, Phase,
    PhaseBoard, PhaseTag, Price, RejectionSeverity, Role, SettlementValidator, Settlement,
};
use auctd_sync::{SyncGate, TimerPool};
use auctd_wire::{Message, Status, Verb};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Tunables every session shares.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Shared-secret token checked at registration.
    pub auth_token: String,
    /// Bounded wait for every outstanding request.
    pub response_timeout: std::time::Duration,
    /// Reconnections honored per identity before penalties start.
    pub reconnect_limit: u32,
}

/// Capability set handed to every session.
///
/// Sessions reach the registry, dispatcher and timing subsystems only
/// through this context; none of them points back at a concrete session.
pub struct SessionContext {
    pub timers: Arc<TimerPool>,
    pub gate: Arc<SyncGate>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub phase_board: Arc<PhaseBoard>,
    pub behavior: Arc<dyn BehaviorController>,
    pub charge_policy: Arc<dyn ChargePolicy>,
    pub order_validator: Arc<dyn OrderValidator>,
    pub settlement_validator: Arc<dyn SettlementValidator>,
    pub identity: Arc<IdentityOffice>,
    pub settings: SessionSettings,
}

/// Per-session traffic counters, logged at disconnect.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub messages_in: u64,
    pub messages_out: u64,
    pub violations: u64,
}

/// A reactive exchange parked until another session decides.
struct ParkedOrder {
    order: Order,
    /// Client correlation id to echo on the eventual response.
    request_id: Option<String>,
    timer: auctd_sync::TimerHandle,
}

struct SessionState {
    client_state: ClientState,
    participant: Option<ParticipantId>,
    role: Option<Role>,
    phase: Phase,
    time: GameTime,
    grammar: ReactiveGrammar,
    /// Proactive exchanges awaiting a response, by exchange id.
    pending: HashMap<u64, PendingExchange>,
    /// Reactive exchanges parked on an operator decision, by order id.
    parked: HashMap<u64, ParkedOrder>,
    /// Client correlation ids with an order in flight.
    inflight_correlations: HashMap<String, u64>,
    /// Operator sessions: orders admitted this day, by order id.
    accepted_orders: HashMap<u64, Order>,
    /// Operator sessions: the fee schedule in force today.
    posted_fees: Option<FeeSchedule>,
    subscribed: bool,
    stats: SessionStats,
}

/// Deferred dispatcher work collected under the session lock.
enum Effect {
    Event {
        target: ParticipantId,
        event: EngineEvent,
        on_failure: Option<FailureCallback>,
    },
    Notify {
        targets: Vec<ParticipantId>,
        message: Message,
    },
    Close {
        reason: &'static str,
    },
}

/// Server-side state for one remote connection.
pub struct Session {
    ctx: Arc<SessionContext>,
    outbound: mpsc::UnboundedSender<Message>,
    peer: String,
    connected_at: DateTime<Utc>,
    next_exchange_id: AtomicU64,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        ctx: Arc<SessionContext>,
        outbound: mpsc::UnboundedSender<Message>,
        peer: impl Into<String>,
    ) -> Arc<Self> {
        let (phase, time) = ctx.phase_board.current();
        Arc::new(Self {
            ctx,
            outbound,
            peer: peer.into(),
            connected_at: Utc::now(),
            next_exchange_id: AtomicU64::new(1),
            state: Mutex::new(SessionState {
                client_state: ClientState::Ready,
                participant: None,
                role: None,
                phase,
                time,
                grammar: ReactiveGrammar::unidentified(),
                pending: HashMap::new(),
                parked: HashMap::new(),
                inflight_correlations: HashMap::new(),
                accepted_orders: HashMap::new(),
                posted_fees: None,
                subscribed: false,
                stats: SessionStats::default(),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub fn client_state(&self) -> ClientState {
        self.state.lock().client_state
    }

    #[must_use]
    pub fn participant(&self) -> Option<ParticipantId> {
        self.state.lock().participant.clone()
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.state.lock().role
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn posted_fees(&self) -> Option<FeeSchedule> {
        self.state.lock().posted_fees
    }

    /// Identity used for logs and behavior records before registration
    /// completes.
    fn effective_id(&self, st: &SessionState) -> ParticipantId {
        st.participant
            .clone()
            .unwrap_or_else(|| ParticipantId::new(format!("peer:{}", self.peer)))
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Process one inbound wire message from this session's remote.
    pub fn handle_inbound(self: &Arc<Self>, msg: Message) {
        let effects = {
            let mut st = self.state.lock();
            if st.client_state == ClientState::ConnClosed {
                return;
            }
            st.stats.messages_in += 1;

            // Staleness check: a tagged message from a different day is
            // silently dropped.
            if let Some(tag) = &msg.tag {
                if st.participant.is_some() && *tag != st.time.tag() {
                    debug!(peer = %self.peer, tag = %tag, current = %st.time.tag(),
                        "Stale message dropped");
                    return;
                }
            }

            if msg.verb.is_response() {
                self.process_response(&mut st, msg)
            } else {
                self.process_request(&mut st, msg)
            }
        };
        self.apply_effects(effects);
    }

    /// Process one event delivered by the dispatcher.
    pub fn handle_event(self: &Arc<Self>, event: EngineEvent) -> SessionResult<()> {
        let effects = {
            let mut st = self.state.lock();
            if !st.client_state.is_live() {
                return Err(SessionError::SessionClosed(self.effective_id(&st)));
            }
            self.process_event(&mut st, event)
        };
        self.apply_effects(effects);
        Ok(())
    }

    /// Forward a wire message to this session's remote participant.
    pub fn forward_to_remote(&self, msg: Message) -> SessionResult<()> {
        let mut st = self.state.lock();
        if !st.client_state.is_live() {
            return Err(SessionError::SessionClosed(self.effective_id(&st)));
        }
        let id = self.effective_id(&st);
        self.push_outbound(&mut st, msg)
            .map_err(|_| SessionError::TransportFailure(format!("outbound closed for {id}")))
    }

    /// Drive this session to CONN_CLOSED.
    ///
    /// Idempotent. Cancels every pending and parked exchange, resolves
    /// forwarded orders as rejections to their submitters and unbinds
    /// the identity from the registry.
    pub fn close(self: &Arc<Self>, reason: &str) {
        let effects = {
            let mut st = self.state.lock();
            if st.client_state == ClientState::ConnClosed {
                return;
            }
            self.shutdown_state(&mut st, reason)
        };
        self.apply_effects(effects);
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    fn apply_effects(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Event {
                    target,
                    event,
                    on_failure,
                } => self.ctx.dispatcher.emit_event(target, event, on_failure),
                Effect::Notify { targets, message } => {
                    self.ctx.dispatcher.broadcast_message(targets, message);
                }
                Effect::Close { reason } => self.close(reason),
            }
        }
    }

    fn push_outbound(&self, st: &mut SessionState, msg: Message) -> Result<(), ()> {
        match self.outbound.send(msg) {
            Ok(()) => {
                st.stats.messages_out += 1;
                Ok(())
            }
            Err(_) => {
                debug!(peer = %self.peer, "Outbound channel closed");
                Err(())
            }
        }
    }

    /// Best-effort response send; a dead outbound channel is resolved by
    /// the connection task closing the session.
    fn respond(&self, st: &mut SessionState, msg: Message) {
        let _ = self.push_outbound(st, msg);
    }

    fn transition(&self, st: &mut SessionState, next: ClientState) {
        if st.client_state.can_transition(next) && st.client_state != next {
            debug!(peer = %self.peer, from = %st.client_state, to = %next, "State transition");
            st.client_state = next;
        }
    }

    /// Mark one successful exchange: ERROR recovers to OK.
    fn mark_success(&self, st: &mut SessionState) {
        if st.client_state == ClientState::Error {
            self.transition(st, ClientState::Ok);
        }
    }

    fn record_violation(&self, st: &mut SessionState, kind: BehaviorKind) {
        let id = self.effective_id(st);
        st.stats.violations += 1;
        self.ctx.behavior.observe(&id, kind);
    }

    fn next_exchange_id(&self) -> u64 {
        self.next_exchange_id.fetch_add(1, Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Proactive exchanges
    // ------------------------------------------------------------------

    /// Open a proactive exchange: send the request and arm its timeout.
    ///
    /// An immediate send failure aborts the exchange and escalates to
    /// ERROR.
    fn open_exchange(self: &Arc<Self>, st: &mut SessionState, kind: ExchangeKind) {
        let exchange_id = self.next_exchange_id();
        let request = kind.build_request(exchange_id, st.time);

        let weak = Arc::downgrade(self);
        let timer = self.ctx.timers.schedule(
            self.ctx.settings.response_timeout,
            move || Self::on_exchange_timeout(&weak, exchange_id),
        );

        st.pending.insert(
            exchange_id,
            PendingExchange {
                id: exchange_id,
                kind,
                timer,
            },
        );

        if self.push_outbound(st, request).is_err() {
            let ex = st.pending.remove(&exchange_id);
            if let Some(ex) = ex {
                self.ctx.timers.cancel(&ex.timer);
            }
            warn!(peer = %self.peer, exchange_id, "Proactive send failed, exchange aborted");
            self.transition(st, ClientState::Error);
        }
    }

    /// Timer callback for a proactive exchange.
    ///
    /// A resolved exchange is a benign race and is ignored; an exchange
    /// still pending escalates the session to FATAL.
    fn on_exchange_timeout(weak: &Weak<Session>, exchange_id: u64) {
        let Some(session) = weak.upgrade() else {
            return;
        };
        let effects = {
            let mut st = session.state.lock();
            match st.pending.remove(&exchange_id) {
                None => {
                    debug!(exchange_id, "Timeout after resolution, ignored");
                    return;
                }
                Some(ex) => {
                    warn!(
                        peer = %session.peer,
                        exchange_id,
                        kind = ex.kind.label(),
                        "Exchange timed out"
                    );
                    session.fatal(&mut st, "exchange timeout")
                }
            }
        };
        session.apply_effects(effects);
    }

    /// Escalate to FATAL: grammar closes and the session transitions to
    /// CONN_CLOSED immediately.
    fn fatal(self: &Arc<Self>, st: &mut SessionState, reason: &'static str) -> Vec<Effect> {
        self.transition(st, ClientState::Fatal);
        st.grammar = ReactiveGrammar::closed();
        vec![Effect::Close { reason }]
    }

    fn shutdown_state(self: &Arc<Self>, st: &mut SessionState, reason: &str) -> Vec<Effect> {
        let id = self.effective_id(st);
        let mut effects = Vec::new();

        // Cancel proactive exchanges; forwarded orders resolve as
        // rejections to their submitters.
        for (_, ex) in st.pending.drain() {
            self.ctx.timers.cancel(&ex.timer);
            if let ExchangeKind::OrderDecision { order } = ex.kind {
                effects.push(Effect::Event {
                    target: order.owner.clone(),
                    event: EngineEvent::OrderDecided {
                        order_id: order.id,
                        submitter: order.owner,
                        accepted: false,
                        reason: Some("market operator unavailable".to_string()),
                    },
                    on_failure: None,
                });
            }
        }

        // Cancel parked exchanges; their submitters sit on this very
        // session, so answer them directly.
        let parked: Vec<ParkedOrder> = st.parked.drain().map(|(_, p)| p).collect();
        for parked in parked {
            self.ctx.timers.cancel(&parked.timer);
            let mut response = Message::new(Verb::Invalid).with_type("failed");
            response.id = parked.request_id;
            self.respond(st, response);
        }
        st.inflight_correlations.clear();

        st.grammar = ReactiveGrammar::closed();
        st.client_state = ClientState::ConnClosed;

        if let Some(participant) = &st.participant {
            self.ctx.registry.unbind(participant);
        }

        info!(
            peer = %self.peer,
            participant = %id,
            reason,
            uptime_s = (Utc::now() - self.connected_at).num_seconds(),
            messages_in = st.stats.messages_in,
            messages_out = st.stats.messages_out,
            violations = st.stats.violations,
            "Session closed"
        );

        effects
    }

    // ------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------

    fn process_response(self: &Arc<Self>, st: &mut SessionState, msg: Message) -> Vec<Effect> {
        let Some(exchange_id) = msg.numeric_id() else {
            self.record_violation(st, BehaviorKind::MalformedMessage);
            return Vec::new();
        };

        // The timer's atomic state is the race arbiter: if the cancel
        // loses, the timeout path owns this exchange and the late
        // response is dropped.
        let Some(ex) = st.pending.get(&exchange_id) else {
            debug!(exchange_id, "Response for unknown exchange, ignored");
            return Vec::new();
        };
        if !self.ctx.timers.cancel(&ex.timer) {
            debug!(exchange_id, "Response lost race against timeout, ignored");
            return Vec::new();
        }
        let Some(ex) = st.pending.remove(&exchange_id) else {
            return Vec::new();
        };

        let status = msg.status().unwrap_or(Status::Error);
        self.mark_success(st);

        match ex.kind {
            ExchangeKind::PhaseSync { tag } => {
                if status == Status::Ok {
                    if let Some(participant) = st.participant.clone() {
                        self.ctx.gate.acknowledge(&tag, &participant);
                    }
                } else {
                    warn!(peer = %self.peer, tag = %tag, ?status, "Phase notice rejected by remote");
                }
                Vec::new()
            }
            ExchangeKind::FeeQuote { .. } => match msg.value.as_deref() {
                Some(value) if status == Status::Ok => match FeeSchedule::wire_decode(value) {
                    Ok(fees) => match self.apply_fee_schedule(st, fees) {
                        Ok(effects) => effects,
                        Err(reason) => {
                            warn!(peer = %self.peer, reason = %reason, "Fee schedule rejected");
                            Vec::new()
                        }
                    },
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "Unparseable fee schedule");
                        self.record_violation(st, BehaviorKind::MalformedMessage);
                        Vec::new()
                    }
                },
                _ => {
                    warn!(peer = %self.peer, ?status, "Operator declined fee solicitation");
                    Vec::new()
                }
            },
            ExchangeKind::OrderDecision { order } => {
                self.finish_order_decision(st, order, status == Status::Ok, msg.value)
            }
        }
    }

    /// Operator session: the remote decided on a forwarded order.
    fn finish_order_decision(
        &self,
        st: &mut SessionState,
        order: Order,
        accepted: bool,
        reason: Option<String>,
    ) -> Vec<Effect> {
        let mut effects = vec![Effect::Event {
            target: order.owner.clone(),
            event: EngineEvent::OrderDecided {
                order_id: order.id,
                submitter: order.owner.clone(),
                accepted,
                reason: reason.clone(),
            },
            on_failure: None,
        }];

        if accepted {
            st.accepted_orders.insert(order.id, order.clone());
            // Posted-order notification for all subscribers, same id and
            // price the submitter sees.
            let notification = Message::new(Verb::Post)
                .with_type("order-posted")
                .with_id(order.id.to_string())
                .with_tag(st.time.tag())
                .with_time(st.time.into())
                .with_value(format!(
                    "{},{},{}",
                    order.side, order.price, order.quantity
                ));
            effects.push(Effect::Notify {
                targets: self.ctx.registry.subscribers(),
                message: notification,
            });
        }
        effects
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    fn process_request(self: &Arc<Self>, st: &mut SessionState, msg: Message) -> Vec<Effect> {
        let Some(_entry) = st.grammar.first_match(&msg) else {
            // Protocol violation: not legal in this phase. Recorded, not
            // fatal by itself; ClientState stays where it is.
            debug!(peer = %self.peer, verb = %msg.verb, phase = %st.phase, "Wrong-phase message");
            self.record_violation(st, BehaviorKind::WrongPhaseMessage);
            let response = Message::response(Status::Error, &msg).with_type("wrong-phase");
            self.respond(st, response);
            return Vec::new();
        };

        match msg.verb {
            Verb::Register => self.process_register(st, msg),
            Verb::Subscribe => {
                st.subscribed = true;
                let response = Message::response(Status::Ok, &msg);
                self.respond(st, response);
                self.mark_success(st);
                Vec::new()
            }
            Verb::Get => {
                let response = Message::response(Status::Ok, &msg)
                    .with_type("status")
                    .with_value(st.phase.to_string())
                    .with_time(st.time.into());
                self.respond(st, response);
                self.mark_success(st);
                Vec::new()
            }
            Verb::Order => self.process_order(st, msg),
            Verb::Settle => self.process_settle(st, msg),
            Verb::Options => self.process_options(st, msg),
            // Remaining verbs never appear in a grammar.
            _ => Vec::new(),
        }
    }

    fn process_register(self: &Arc<Self>, st: &mut SessionState, msg: Message) -> Vec<Effect> {
        // Shared-secret check comes first; a bad token is unrecoverable.
        if msg.value.as_deref() != Some(self.ctx.settings.auth_token.as_str()) {
            warn!(peer = %self.peer, "Registration with bad token");
            let response = Message::response(Status::Error, &msg).with_type("auth");
            self.respond(st, response);
            return self.fatal(st, "authentication failed");
        }

        // Re-registration after identification is idempotent.
        if let Some(participant) = st.participant.clone() {
            let response = Message::response(Status::Ok, &msg).with_id(participant.to_string());
            self.respond(st, response);
            self.mark_success(st);
            return Vec::new();
        }

        let Some(role) = msg.msg_type.as_deref().and_then(|t| t.parse::<Role>().ok()) else {
            self.record_violation(st, BehaviorKind::MalformedMessage);
            let response = Message::response(Status::Error, &msg).with_type("role");
            self.respond(st, response);
            return Vec::new();
        };

        let claimed = msg
            .id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(ParticipantId::from);
        let identity = claimed.unwrap_or_else(|| self.ctx.identity.participant_id(role));

        // A pending disconnect penalty is consulted before honoring a
        // reconnection.
        if self.ctx.registry.is_known(&identity)
            && self
                .ctx
                .behavior
                .pending_penalty(&identity, PenaltyKind::Disconnect)
        {
            self.ctx
                .behavior
                .penalty_executed(&identity, PenaltyKind::Disconnect);
            let response = Message::response(Status::Error, &msg).with_type("banned");
            self.respond(st, response);
            return self.fatal(st, "reconnect penalty");
        }

        match self.ctx.registry.bind(identity.clone(), self.clone()) {
            Err(_) => {
                let response = Message::response(Status::Error, &msg).with_type("identity-in-use");
                self.respond(st, response);
                self.record_violation(st, BehaviorKind::MalformedMessage);
                Vec::new()
            }
            Ok(prior_connections) => {
                if prior_connections > self.ctx.settings.reconnect_limit {
                    self.ctx
                        .behavior
                        .observe(&identity, BehaviorKind::ExcessiveReconnect);
                }

                st.participant = Some(identity.clone());
                st.role = Some(role);
                let (phase, time) = self.ctx.phase_board.current();
                st.phase = phase;
                st.time = time;
                st.grammar = ReactiveGrammar::for_phase(phase, role);
                self.transition(st, ClientState::Ok);

                info!(peer = %self.peer, participant = %identity, role = %role,
                    reconnects = prior_connections, "Participant identified");
                let response = Message::response(Status::Ok, &msg)
                    .with_id(identity.to_string())
                    .with_tag(time.tag())
                    .with_time(time.into());
                self.respond(st, response);
                Vec::new()
            }
        }
    }

    fn process_order(self: &Arc<Self>, st: &mut SessionState, msg: Message) -> Vec<Effect> {
        let owner = self
            .effective_id(st);

        // A second concurrent order for the same correlation id while one
        // is parked is a protocol violation.
        if let Some(correlation) = msg.id.as_deref() {
            if st.inflight_correlations.contains_key(correlation) {
                self.record_violation(st, BehaviorKind::DuplicateOrder);
                let response = Message::response(Status::Error, &msg).with_type("duplicate");
                self.respond(st, response);
                return Vec::new();
            }
        }

        // Grammar pinned the side: sellers ask, buyers bid.
        let side = match msg.msg_type.as_deref() {
            Some("ask") => OrderSide::Ask,
            _ => OrderSide::Bid,
        };

        let Some((operator, price, quantity)) =
            msg.value.as_deref().and_then(parse_order_value)
        else {
            self.record_violation(st, BehaviorKind::MalformedMessage);
            self.transition(st, ClientState::Error);
            let response = Message::response(Status::Error, &msg).with_type("malformed");
            self.respond(st, response);
            return Vec::new();
        };

        // The submitter may be serving a day ban.
        if self
            .ctx
            .behavior
            .pending_penalty(&owner, PenaltyKind::DayBan)
        {
            let response = Message::response(Status::Invalid, &msg).with_type("banned");
            self.respond(st, response);
            return Vec::new();
        }

        let operator_live = self
            .ctx
            .registry
            .get(&operator)
            .is_some_and(|s| s.role() == Some(Role::Operator));
        if !operator_live {
            let response = Message::response(Status::Invalid, &msg).with_type("unknown-market");
            self.respond(st, response);
            return Vec::new();
        }

        let order = Order {
            id: self.ctx.identity.order_id(),
            owner: owner.clone(),
            operator: operator.clone(),
            side,
            price,
            quantity,
            day: st.time.day,
        };

        if let Err(rejection) = self.ctx.order_validator.validate(&order) {
            self.transition(st, ClientState::Error);
            let status = match rejection.severity() {
                RejectionSeverity::Invalid => Status::Invalid,
                RejectionSeverity::Error => Status::Error,
            };
            let response =
                Message::response(status, &msg).with_value(rejection.to_string());
            self.respond(st, response);
            return Vec::new();
        }

        // Park the request until the operator decides, bounded by the
        // response timeout.
        let order_id = order.id;
        let weak = Arc::downgrade(self);
        let timer = self.ctx.timers.schedule(
            self.ctx.settings.response_timeout,
            move || Self::on_parked_timeout(&weak, order_id),
        );
        st.parked.insert(
            order_id,
            ParkedOrder {
                order: order.clone(),
                request_id: msg.id.clone(),
                timer,
            },
        );
        if let Some(correlation) = msg.id.clone() {
            st.inflight_correlations.insert(correlation, order_id);
        }
        self.mark_success(st);

        // Forward to the owning operator; a failed forward synthesizes a
        // rejection back to the submitter.
        let weak = Arc::downgrade(self);
        let on_failure: FailureCallback = Box::new(move |target, failure| {
            if let Some(session) = weak.upgrade() {
                debug!(operator = %target, ?failure, order_id, "Order forward failed");
                session.reject_parked(order_id, "market unreachable");
            }
        });
        vec![Effect::Event {
            target: operator,
            event: EngineEvent::OrderSubmitted { order },
            on_failure: Some(on_failure),
        }]
    }

    /// Timer callback for a parked order: answer the submitter INVALID.
    fn on_parked_timeout(weak: &Weak<Session>, order_id: u64) {
        if let Some(session) = weak.upgrade() {
            session.reject_parked(order_id, "timeout");
        }
    }

    /// Resolve a parked order as a rejection, if still parked.
    fn reject_parked(self: &Arc<Self>, order_id: u64, reason: &str) {
        let mut st = self.state.lock();
        let Some(parked) = st.parked.remove(&order_id) else {
            return;
        };
        self.ctx.timers.cancel(&parked.timer);
        if let Some(correlation) = &parked.request_id {
            st.inflight_correlations.remove(correlation);
        }
        let mut response = Message::new(Verb::Invalid)
            .with_type("rejected")
            .with_value(reason.to_string());
        response.id = parked.request_id;
        response.tag = Some(st.time.tag());
        self.respond(&mut st, response);
    }

    fn process_settle(self: &Arc<Self>, st: &mut SessionState, msg: Message) -> Vec<Effect> {
        let operator = self.effective_id(st);

        let Some((ask_id, bid_id, price)) = msg.value.as_deref().and_then(parse_settle_value)
        else {
            self.record_violation(st, BehaviorKind::MalformedMessage);
            self.transition(st, ClientState::Error);
            let response = Message::response(Status::Error, &msg).with_type("malformed");
            self.respond(st, response);
            return Vec::new();
        };

        let (Some(ask), Some(bid)) = (
            st.accepted_orders.get(&ask_id).cloned(),
            st.accepted_orders.get(&bid_id).cloned(),
        ) else {
            self.transition(st, ClientState::Error);
            let response = Message::response(Status::Error, &msg).with_type("unknown-order");
            self.respond(st, response);
            return Vec::new();
        };

        let settlement = Settlement {
            id: self.ctx.identity.settlement_id(),
            operator: operator.clone(),
            ask_id,
            bid_id,
            price,
            day: st.time.day,
        };

        if let Err(rejection) = self
            .ctx
            .settlement_validator
            .validate(&settlement, &ask, &bid)
        {
            self.transition(st, ClientState::Error);
            let status = match rejection.severity() {
                RejectionSeverity::Invalid => Status::Invalid,
                RejectionSeverity::Error => Status::Error,
            };
            let response = Message::response(status, &msg).with_value(rejection.to_string());
            self.respond(st, response);
            return Vec::new();
        }

        st.accepted_orders.remove(&ask_id);
        st.accepted_orders.remove(&bid_id);
        self.mark_success(st);

        let response = Message::response(Status::Ok, &msg).with_value(settlement.id.to_string());
        self.respond(st, response);

        let notification = Message::new(Verb::Post)
            .with_type("settlement-posted")
            .with_id(settlement.id.to_string())
            .with_tag(st.time.tag())
            .with_time(st.time.into())
            .with_value(format!("{ask_id},{bid_id},{price}"));

        vec![
            Effect::Event {
                target: ask.owner.clone(),
                event: EngineEvent::SettlementExecuted {
                    settlement: settlement.clone(),
                },
                on_failure: None,
            },
            Effect::Event {
                target: bid.owner.clone(),
                event: EngineEvent::SettlementExecuted { settlement },
                on_failure: None,
            },
            Effect::Notify {
                targets: self.ctx.registry.subscribers(),
                message: notification,
            },
        ]
    }

    fn process_options(self: &Arc<Self>, st: &mut SessionState, msg: Message) -> Vec<Effect> {
        // A banned operator's schedule is not accepted for the day.
        let me = self.effective_id(st);
        if self.ctx.behavior.pending_penalty(&me, PenaltyKind::DayBan) {
            let response = Message::response(Status::Invalid, &msg).with_type("banned");
            self.respond(st, response);
            return Vec::new();
        }

        let fees = match msg.value.as_deref().map(FeeSchedule::wire_decode) {
            Some(Ok(fees)) => fees,
            _ => {
                self.record_violation(st, BehaviorKind::MalformedMessage);
                self.transition(st, ClientState::Error);
                let response = Message::response(Status::Error, &msg).with_type("malformed");
                self.respond(st, response);
                return Vec::new();
            }
        };

        // An OPTIONS submission also resolves an outstanding fee
        // solicitation, if one is pending.
        let quote_id = st
            .pending
            .iter()
            .find(|(_, ex)| matches!(ex.kind, ExchangeKind::FeeQuote { .. }))
            .map(|(id, _)| *id);
        if let Some(id) = quote_id {
            if let Some(ex) = st.pending.remove(&id) {
                self.ctx.timers.cancel(&ex.timer);
            }
        }

        match self.apply_fee_schedule(st, fees) {
            Ok(effects) => {
                let posted = st.posted_fees.unwrap_or(fees);
                let response = if posted == fees {
                    Message::response(Status::Ok, &msg)
                } else {
                    // Silent clamp: the adjusted vector is authoritative
                    // and echoed back.
                    Message::response(Status::Ok, &msg).with_value(posted.wire_encode())
                };
                self.respond(st, response);
                self.mark_success(st);
                effects
            }
            Err(reason) => {
                // Hard rejection: the operator is banned for the day via
                // the behavior controller.
                self.transition(st, ClientState::Error);
                let response = Message::response(Status::Invalid, &msg).with_value(reason);
                self.respond(st, response);
                Vec::new()
            }
        }
    }

    /// Run the charge policy over a proposed schedule; store the ruling
    /// vector and notify subscribers on pass or clamp.
    fn apply_fee_schedule(
        &self,
        st: &mut SessionState,
        proposed: FeeSchedule,
    ) -> Result<Vec<Effect>, String> {
        let fees = match self.ctx.charge_policy.evaluate(&proposed) {
            FeeRuling::Reject(reason) => {
                self.record_violation(st, BehaviorKind::FeeViolation);
                return Err(reason);
            }
            FeeRuling::Clamp(adjusted) => adjusted,
            FeeRuling::Pass => proposed,
        };

        let operator = self.effective_id(st);
        st.posted_fees = Some(fees);
        info!(operator = %operator, fees = %fees.wire_encode(), "Fee schedule posted");

        let notification = Message::new(Verb::Post)
            .with_type("fees-posted")
            .with_id(operator.to_string())
            .with_tag(st.time.tag())
            .with_time(st.time.into())
            .with_value(fees.wire_encode());
        Ok(vec![Effect::Notify {
            targets: self.ctx.registry.subscribers(),
            message: notification,
        }])
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn process_event(self: &Arc<Self>, st: &mut SessionState, event: EngineEvent) -> Vec<Effect> {
        match event {
            EngineEvent::PhaseBegun { phase, time } => self.process_phase(st, phase, time),
            EngineEvent::OrderSubmitted { order } => self.process_order_submitted(st, order),
            EngineEvent::OrderDecided {
                order_id,
                accepted,
                reason,
                ..
            } => {
                self.resolve_parked(st, order_id, accepted, reason);
                Vec::new()
            }
            EngineEvent::SettlementExecuted { settlement } => {
                let notice = Message::new(Verb::Post)
                    .with_type("settlement")
                    .with_id(settlement.id.to_string())
                    .with_tag(st.time.tag())
                    .with_time(st.time.into())
                    .with_value(format!("{},{}", settlement.price, settlement.day));
                self.respond(st, notice);
                Vec::new()
            }
        }
    }

    fn process_phase(
        self: &Arc<Self>,
        st: &mut SessionState,
        phase: Phase,
        time: GameTime,
    ) -> Vec<Effect> {
        let role = st.role;
        st.phase = phase;
        st.time = time;
        if let Some(role) = role {
            // The legal grammar is replaced wholesale on every phase
            // transition.
            st.grammar = ReactiveGrammar::for_phase(phase, role);
        }

        if phase == Phase::DayOpening {
            // New day: accepted orders and parked exchanges do not
            // survive, and a served day ban lapses.
            for (_, order) in st.accepted_orders.drain() {
                debug!(order_id = order.id, "Order expired with the day");
            }
            let parked: Vec<ParkedOrder> = st.parked.drain().map(|(_, p)| p).collect();
            for parked in parked {
                self.ctx.timers.cancel(&parked.timer);
                let mut response = Message::new(Verb::Invalid).with_type("expired");
                response.id = parked.request_id;
                self.respond(st, response);
            }
            st.inflight_correlations.clear();
            st.posted_fees = None;

            let id = self.effective_id(st);
            if self.ctx.behavior.pending_penalty(&id, PenaltyKind::DayBan) {
                self.ctx.behavior.penalty_executed(&id, PenaltyKind::DayBan);
            }
        }

        let tag = PhaseTag::new(phase, time);
        self.open_exchange(st, ExchangeKind::PhaseSync { tag: tag.clone() });

        if phase.solicits_fees() && role == Some(Role::Operator) {
            self.open_exchange(st, ExchangeKind::FeeQuote { tag });
        }
        Vec::new()
    }

    /// Operator session: an order arrived from a trader's session.
    fn process_order_submitted(
        self: &Arc<Self>,
        st: &mut SessionState,
        order: Order,
    ) -> Vec<Effect> {
        let me = self.effective_id(st);

        // An operator serving a day ban admits nothing.
        if self.ctx.behavior.pending_penalty(&me, PenaltyKind::DayBan) {
            return vec![Effect::Event {
                target: order.owner.clone(),
                event: EngineEvent::OrderDecided {
                    order_id: order.id,
                    submitter: order.owner,
                    accepted: false,
                    reason: Some("market banned for the day".to_string()),
                },
                on_failure: None,
            }];
        }

        self.open_exchange(st, ExchangeKind::OrderDecision { order });
        Vec::new()
    }

    /// Trader session: the operator decided; answer the parked request.
    fn resolve_parked(
        &self,
        st: &mut SessionState,
        order_id: u64,
        accepted: bool,
        reason: Option<String>,
    ) {
        let Some(parked) = st.parked.remove(&order_id) else {
            debug!(order_id, "Decision for unparked order, ignored");
            return;
        };
        self.ctx.timers.cancel(&parked.timer);
        if let Some(correlation) = &parked.request_id {
            st.inflight_correlations.remove(correlation);
        }

        let mut response = if accepted {
            Message::new(Verb::Ok).with_value(parked.order.id.to_string())
        } else {
            let mut m = Message::new(Verb::Invalid).with_type("rejected");
            if let Some(reason) = reason {
                m = m.with_value(reason);
            }
            m
        };
        response.id = parked.request_id;
        response.tag = Some(st.time.tag());
        response.time = Some(st.time.into());
        self.respond(st, response);
        self.mark_success(st);
    }
}

/// Parse an ORDER `Value`: `operator,price,quantity`.
fn parse_order_value(value: &str) -> Option<(ParticipantId, Price, u32)> {
    let mut parts = value.split(',').map(str::trim);
    let operator = parts.next().filter(|s| !s.is_empty())?;
    let price: Price = parts.next()?.parse().ok()?;
    let quantity: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((ParticipantId::from(operator), price, quantity))
}

/// Parse a SETTLE `Value`: `ask_id,bid_id,price`.
fn parse_settle_value(value: &str) -> Option<(u64, u64, Price)> {
    let mut parts = value.split(',').map(str::trim);
    let ask_id: u64 = parts.next()?.parse().ok()?;
    let bid_id: u64 = parts.next()?.parse().ok()?;
    let price: Price = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((ask_id, bid_id, price))
}
