//! Main application orchestration.
//!
//! Builds every subsystem once at startup (timer pool, sync gate,
//! registry, dispatcher, phase board, collaborator policies) and hands
//! explicit references to the components that need them. No global
//! state; the wiring is the dependency graph.

use crate::config::ServerConfig;
use crate::connection::serve_connection;
use crate::error::AppResult;
use auctd_clock::PhaseClock;
use auctd_core::{
    BoundedChargePolicy, BoundsOrderValidator, BoundsSettlementValidator, IdentityOffice,
    PhaseBoard, Price, ThresholdBehaviorController,
};
use auctd_session::{
    ConnectionRegistry, DeliveryMode, Dispatcher, SessionContext, SessionSettings,
};
use auctd_sync::{SyncGate, TimerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The assembled server.
pub struct Application {
    config: ServerConfig,
    ctx: Arc<SessionContext>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    gate: Arc<SyncGate>,
    board: Arc<PhaseBoard>,
    shutdown: CancellationToken,
}

impl Application {
    /// Wire up every subsystem from configuration.
    pub fn new(config: ServerConfig) -> AppResult<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            DeliveryMode::from(config.delivery),
        ));
        let gate = Arc::new(SyncGate::new());
        let board = Arc::new(PhaseBoard::new());
        let shutdown = CancellationToken::new();

        let (fee_min, fee_max) = config.fee_bounds();
        let ctx = Arc::new(SessionContext {
            timers: Arc::new(TimerPool::new()),
            gate: gate.clone(),
            registry: registry.clone(),
            dispatcher: dispatcher.clone(),
            phase_board: board.clone(),
            behavior: Arc::new(ThresholdBehaviorController::new(
                config.behavior.thresholds(),
            )),
            charge_policy: Arc::new(BoundedChargePolicy::new(
                fee_min,
                fee_max,
                config.fees.reject_out_of_bounds,
            )),
            order_validator: Arc::new(BoundsOrderValidator {
                min_price: Price::new(config.orders.min_price),
                max_price: Price::new(config.orders.max_price),
                max_quantity: config.orders.max_quantity,
            }),
            settlement_validator: Arc::new(BoundsSettlementValidator),
            identity: Arc::new(IdentityOffice::new()),
            settings: SessionSettings {
                auth_token: config.auth_token.clone(),
                response_timeout: Duration::from_millis(config.response_timeout_ms),
                reconnect_limit: config.reconnect_limit,
            },
        });

        Ok(Self {
            config,
            ctx,
            dispatcher,
            registry,
            gate,
            board,
            shutdown,
        })
    }

    /// Token that stops the listener, clock and every connection task.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured listen address and run to completion.
    pub async fn run(self) -> AppResult<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Run on an already-bound listener (lets tests use an ephemeral
    /// port).
    pub async fn run_with_listener(self, listener: TcpListener) -> AppResult<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, mode = ?self.dispatcher.mode(), "auctd listening");

        // Asynchronous delivery gets its dedicated queue worker.
        if self.dispatcher.mode() == DeliveryMode::Asynchronous {
            let dispatcher = self.dispatcher.clone();
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                dispatcher.run_worker(token).await;
            });
        }

        let (clock, _clock_handle) = PhaseClock::new(
            self.config.clock.clone(),
            self.gate.clone(),
            self.dispatcher.clone(),
            self.registry.clone(),
            self.board.clone(),
            self.shutdown.clone(),
        );
        let mut clock_task = tokio::spawn(clock.run());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let ctx = self.ctx.clone();
                            let token = self.shutdown.clone();
                            let max_frame = self.config.max_frame_bytes;
                            tokio::spawn(async move {
                                serve_connection(ctx, stream, peer, max_frame, token).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }

                result = &mut clock_task => {
                    if let Err(e) = result {
                        warn!(error = %e, "Clock task ended abnormally");
                    }
                    info!("Simulation over, shutting down");
                    self.shutdown.cancel();
                    break;
                }

                () = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    clock_task.abort();
                    break;
                }
            }
        }

        // Close any session still bound; their connection tasks observe
        // the cancelled token and finish.
        for id in self.registry.active() {
            if let Some(session) = self.registry.get(&id) {
                session.close("server shutdown");
            }
        }

        info!("auctd stopped");
        Ok(())
    }
}
