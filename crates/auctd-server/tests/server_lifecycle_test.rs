//! Server lifecycle integration tests.
//!
//! Drives a real TCP client against the running application: the full
//! registration → phase notices → acknowledgment loop, plus the failure
//! paths a remote participant can hit.

use auctd_clock::ClockConfig;
use auctd_server::config::DeliveryConfig;
use auctd_server::{Application, ServerConfig};
use auctd_wire::{LineCodec, Message, Verb};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const TOKEN: &str = "integration";

fn test_config(clock: ClockConfig) -> ServerConfig {
    ServerConfig {
        auth_token: TOKEN.to_string(),
        delivery: DeliveryConfig::Asynchronous,
        response_timeout_ms: 2_000,
        clock,
        ..ServerConfig::default()
    }
}

fn quick_clock() -> ClockConfig {
    ClockConfig {
        games: 1,
        days_per_game: 1,
        rounds_per_day: 1,
        round_len_ms: 100,
        game_init_ms: 100,
        game_break_ms: 0,
        day_init_ms: 50,
        round_break_ms: 0,
        sync_timeout_ms: 500,
        realtime: true,
    }
}

async fn start_server(
    config: ServerConfig,
) -> (SocketAddr, JoinHandle<auctd_server::AppResult<()>>, CancellationToken) {
    let app = Application::new(config).expect("application builds");
    let shutdown = app.shutdown_token();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(app.run_with_listener(listener));
    (addr, task, shutdown)
}

struct TestClient {
    framed: Framed<TcpStream, LineCodec>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Self {
            framed: Framed::new(stream, LineCodec::default()),
        }
    }

    async fn send(&mut self, msg: Message) {
        self.framed.send(msg).await.expect("send");
    }

    async fn recv(&mut self) -> Option<Message> {
        match timeout(Duration::from_secs(5), self.framed.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            _ => None,
        }
    }

    async fn register(&mut self, role: &str, id: &str) -> Message {
        self.send(
            Message::new(Verb::Register)
                .with_type(role)
                .with_id(id)
                .with_value(TOKEN),
        )
        .await;
        // Phase notices may interleave with the registration response.
        loop {
            let msg = self.recv().await.expect("registration response");
            if msg.verb != Verb::Post {
                return msg;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_plays_a_full_mini_game() {
    let (addr, task, _shutdown) = start_server(test_config(quick_clock())).await;

    let mut client = TestClient::connect(addr).await;
    let response = client.register("buyer", "it-b1").await;
    assert_eq!(response.verb, Verb::Ok);
    assert_eq!(response.id.as_deref(), Some("it-b1"));

    // Acknowledge every phase notice until the simulation ends.
    let mut saw_simulation_over = false;
    while let Some(msg) = client.recv().await {
        if msg.verb == Verb::Post && msg.msg_type.as_deref() == Some("phase") {
            let phase = msg.value.clone().unwrap_or_default();
            if let Some(id) = msg.id.clone() {
                client.send(Message::new(Verb::Ok).with_id(id)).await;
            }
            if phase == "SimulationOver" {
                saw_simulation_over = true;
                break;
            }
        }
    }
    assert!(saw_simulation_over, "client should see the final phase");

    // The server exits gracefully after SimulationOver.
    let result = timeout(Duration::from_secs(5), task)
        .await
        .expect("server stops after the simulation")
        .expect("task join");
    assert!(result.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_token_refused_and_disconnected() {
    let mut clock = quick_clock();
    clock.game_init_ms = 2_000; // hold the early phase while we probe
    let (addr, task, shutdown) = start_server(test_config(clock)).await;

    let mut client = TestClient::connect(addr).await;
    client
        .send(
            Message::new(Verb::Register)
                .with_type("buyer")
                .with_id("it-b1")
                .with_value("wrong-token"),
        )
        .await;

    let response = client.recv().await.expect("error response");
    assert_eq!(response.verb, Verb::Error);
    assert_eq!(response.msg_type.as_deref(), Some("auth"));

    // The session is fatal: the server drops the connection.
    assert!(client.recv().await.is_none());

    shutdown.cancel();
    let _ = timeout(Duration::from_secs(5), task).await.expect("server stops");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_early_order_is_wrong_phase() {
    let mut clock = quick_clock();
    clock.game_init_ms = 2_000; // trading is far from open
    let (addr, task, shutdown) = start_server(test_config(clock)).await;

    let mut client = TestClient::connect(addr).await;
    let response = client.register("seller", "it-s1").await;
    assert_eq!(response.verb, Verb::Ok);

    client
        .send(
            Message::new(Verb::Order)
                .with_type("ask")
                .with_id("c1")
                .with_value("m1,10,1"),
        )
        .await;

    // Skip any phase notices racing the response.
    let response = loop {
        let msg = client.recv().await.expect("order response");
        if msg.verb != Verb::Post {
            break msg;
        }
    };
    assert_eq!(response.verb, Verb::Error);
    assert_eq!(response.msg_type.as_deref(), Some("wrong-phase"));
    assert_eq!(response.id.as_deref(), Some("c1"));

    shutdown.cancel();
    let _ = timeout(Duration::from_secs(5), task).await.expect("server stops");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_clients_register_distinct_identities() {
    let mut clock = quick_clock();
    clock.game_init_ms = 2_000;
    let (addr, task, shutdown) = start_server(test_config(clock)).await;

    let mut c1 = TestClient::connect(addr).await;
    let mut c2 = TestClient::connect(addr).await;

    let r1 = c1.register("buyer", "").await;
    let r2 = c2.register("seller", "").await;
    assert_eq!(r1.verb, Verb::Ok);
    assert_eq!(r2.verb, Verb::Ok);
    let id1 = r1.id.unwrap();
    let id2 = r2.id.unwrap();
    assert!(id1.starts_with("buyer_"));
    assert!(id2.starts_with("seller_"));
    assert_ne!(id1, id2);

    shutdown.cancel();
    let _ = timeout(Duration::from_secs(5), task).await.expect("server stops");
}
