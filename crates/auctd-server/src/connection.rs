//! Per-connection task: socket framing and session plumbing.
//!
//! One task per accepted TCP connection. Inbound frames feed the
//! session's state machine; the session's outbound channel drains back
//! onto the socket. The task ends when the peer disconnects, the session
//! reaches CONN_CLOSED, or the server shuts down.

use auctd_session::{ClientState, Session, SessionContext};
use auctd_wire::{LineCodec, Message, Verb, WireError};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the task re-checks session liveness while idle. Timer-driven
/// escalations (exchange timeouts) close the session outside this task.
const LIVENESS_CHECK: Duration = Duration::from_millis(500);

/// Serve one accepted connection until it ends.
pub async fn serve_connection(
    ctx: Arc<SessionContext>,
    stream: TcpStream,
    peer: SocketAddr,
    max_frame: usize,
    shutdown: CancellationToken,
) {
    info!(%peer, "Connection accepted");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let session = Session::new(ctx, outbound_tx, peer.to_string());
    let mut framed = Framed::new(stream, LineCodec::new(max_frame));

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                session.close("server shutdown");
                break;
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = framed.send(msg).await {
                            warn!(%peer, error = %e, "Socket write failed");
                            session.close("write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }

            frame = framed.next() => {
                match frame {
                    Some(Ok(msg)) => session.handle_inbound(msg),
                    Some(Err(WireError::Io(e))) => {
                        warn!(%peer, error = %e, "Socket read failed");
                        session.close("read failed");
                        break;
                    }
                    Some(Err(e)) => {
                        // Unframeable input: answer ERROR and drop the
                        // connection; resynchronizing the stream is not
                        // worth guessing at.
                        warn!(%peer, error = %e, "Undecodable frame");
                        let _ = framed
                            .send(Message::new(Verb::Error).with_type("malformed"))
                            .await;
                        session.close("undecodable frame");
                        break;
                    }
                    None => {
                        debug!(%peer, "Peer disconnected");
                        session.close("peer disconnected");
                        break;
                    }
                }
            }

            () = tokio::time::sleep(LIVENESS_CHECK) => {}
        }

        if session.client_state() == ClientState::ConnClosed {
            // Flush whatever the session queued on its way out.
            while let Ok(msg) = outbound_rx.try_recv() {
                if framed.send(msg).await.is_err() {
                    break;
                }
            }
            break;
        }
    }

    info!(%peer, "Connection task finished");
}
