//! Per-connection protocol session machine, connection registry and
//! fan-out dispatcher for the auctd server.
//!
//! The session machine enforces phase-dependent message legality, pairs
//! proactive requests with asynchronous responses and converges failures
//! through a severity ladder. The dispatcher fans phase and market
//! events out to sessions with deterministic event-before-message
//! ordering. The registry is the single shared participant → session
//! map.

pub mod client_state;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod exchange;
pub mod grammar;
pub mod registry;
pub mod session;

pub use client_state::ClientState;
pub use dispatch::{DeliveryMode, DispatchFailure, Dispatcher, FailureCallback};
pub use error::{SessionError, SessionResult};
pub use events::EngineEvent;
pub use exchange::{ExchangeKind, PendingExchange};
pub use grammar::{GrammarEntry, ReactiveGrammar};
pub use registry::ConnectionRegistry;
pub use session::{Session, SessionContext, SessionSettings, SessionStats};
