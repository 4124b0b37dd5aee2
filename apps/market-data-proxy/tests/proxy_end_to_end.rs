//! Proxy End-to-End Tests
//!
//! Runs the event loop, the client listener and real WebSocket clients
//! against a local provider that speaks the upstream feed protocol.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use market_data_proxy::infrastructure::feed::BackoffConfig;
use market_data_proxy::{
    AdapterRegistry, ConnectionContext, ConnectionPool, CoreConfig, EnvCredentialStore, EventLoop,
    FeedClientConfig, HealthSnapshot, PoolLimits, ProviderPools, ProxyCore, ProxyServer,
    SharedHealth, StaticTokenValidator, SymbolMaster, WireFormat, message_bus,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);
const PROVIDER: &str = "kite";

// =============================================================================
// Local Provider
// =============================================================================

/// One accepted provider socket.
struct UpstreamSocket {
    /// Text frames the proxy sent, auth included.
    received: mpsc::UnboundedReceiver<String>,
    /// Frames to push to the proxy. Dropping it drops the socket.
    push: mpsc::UnboundedSender<String>,
}

impl UpstreamSocket {
    async fn expect_subscribe(&mut self, provider_symbol: &str) {
        let quoted = format!("\"{provider_symbol}\"");
        loop {
            let frame = timeout(WAIT, self.received.recv())
                .await
                .expect("no subscribe frame")
                .expect("upstream socket gone");
            if frame.contains(r#""action":"subscribe""#) && frame.contains(&quoted) {
                return;
            }
        }
    }

    fn push_ticks(&self, provider_symbol: &str, prices: &[&str]) {
        let frames: Vec<String> = prices
            .iter()
            .map(|price| format!(r#"{{"T":"tick","S":"{provider_symbol}","lp":{price}}}"#))
            .collect();
        self.push.send(format!("[{}]", frames.join(","))).unwrap();
    }
}

async fn spawn_upstream() -> (String, mpsc::UnboundedReceiver<UpstreamSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (sockets_tx, sockets_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (received_tx, received) = mpsc::unbounded_channel();
            let (push, push_rx) = mpsc::unbounded_channel();
            if sockets_tx.send(UpstreamSocket { received, push }).is_err() {
                break;
            }
            tokio::spawn(serve_upstream(stream, received_tx, push_rx));
        }
    });

    (url, sockets_rx)
}

async fn serve_upstream(
    stream: TcpStream,
    received: mpsc::UnboundedSender<String>,
    mut push: mpsc::UnboundedReceiver<String>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    if ws
        .send(Message::text(r#"[{"T":"success","msg":"connected"}]"#))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().to_owned();
                    if text.contains(r#""action":"auth""#) {
                        let _ = ws
                            .send(Message::text(r#"[{"T":"success","msg":"authenticated"}]"#))
                            .await;
                    }
                    let _ = received.send(text);
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            outgoing = push.recv() => match outgoing {
                Some(text) => {
                    if ws.send(Message::text(text)).await.is_err() {
                        return;
                    }
                }
                // Abrupt drop, no close handshake
                None => return,
            },
        }
    }
}

// =============================================================================
// Proxy
// =============================================================================

struct Proxy {
    addr: SocketAddr,
    health: SharedHealth,
    cancel: CancellationToken,
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_proxy(upstream_url: &str, throttle_interval: Duration) -> Proxy {
    let feed = FeedClientConfig {
        connect_timeout: Duration::from_secs(1),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        },
        ..FeedClientConfig::new(upstream_url, WireFormat::Json)
    };
    let mut adapters = AdapterRegistry::new();
    adapters.register_ws_feed(PROVIDER, feed);

    let mut symbols = SymbolMaster::new();
    symbols.insert("INFY", "NSE", PROVIDER, "INFY-EQ");
    symbols.insert("TCS", "NSE", PROVIDER, "TCS-EQ");

    let credentials = Arc::new(EnvCredentialStore::with_lookup(|_| {
        Some("secret".to_string())
    }));
    let (publisher, consumer) = message_bus(1024);

    let mut pools = ProviderPools::new();
    pools.insert(ConnectionPool::new(
        PROVIDER,
        PoolLimits {
            max_symbols_per_connection: 100,
            max_connections: 2,
        },
        adapters.get(PROVIDER).unwrap(),
        credentials,
        Arc::new(publisher),
    ));

    let core = ProxyCore::new(
        pools,
        Arc::new(symbols),
        CoreConfig {
            throttle_interval,
            unsubscribe_grace: Duration::ZERO,
            idle_connection_grace: Duration::from_secs(60),
        },
    );

    let cancel = CancellationToken::new();
    let health: SharedHealth = Arc::new(RwLock::new(HealthSnapshot::default()));
    let (commands, commands_rx) = mpsc::channel(256);
    let event_loop = EventLoop::new(
        core,
        consumer,
        commands_rx,
        Arc::clone(&health),
        Duration::from_millis(20),
        cancel.clone(),
    );
    tokio::spawn(event_loop.run());

    let tokens = HashMap::from([("good-token".to_string(), "alice".to_string())]);
    let context = ConnectionContext {
        validator: Arc::new(StaticTokenValidator::new(tokens)),
        commands,
        queue_capacity: 64,
        auth_timeout: Duration::from_secs(2),
        cancel: cancel.clone(),
    };
    let server = assert_ok!(ProxyServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), context).await);
    let addr = assert_ok!(server.local_addr());
    tokio::spawn(server.run());

    Proxy {
        addr,
        health,
        cancel,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// =============================================================================
// Client
// =============================================================================

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        Self { ws }
    }

    async fn login(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(json!({"action": "authenticate", "token": "good-token"}))
            .await;
        let reply = client.recv().await;
        assert_eq!(reply["type"], "auth");
        assert_eq!(reply["status"], "success", "{reply}");
        assert_eq!(reply["user_id"], "alice");
        client
    }

    async fn send(&mut self, request: Value) {
        self.send_text(request.to_string()).await;
    }

    async fn send_text(&mut self, text: String) {
        self.ws.send(Message::text(text)).await.unwrap();
    }

    async fn subscribe(&mut self, symbols: &[&str], mode: &str) -> Value {
        let entries: Vec<Value> = symbols
            .iter()
            .map(|symbol| json!({"symbol": symbol, "venue": "NSE"}))
            .collect();
        self.send(json!({"action": "subscribe", "symbols": entries, "mode": mode}))
            .await;
        let reply = self.recv().await;
        assert_eq!(reply["type"], "subscribe", "{reply}");
        reply
    }

    async fn recv(&mut self) -> Value {
        self.recv_within(WAIT).await.expect("no frame from proxy")
    }

    async fn recv_within(&mut self, within: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let message = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()?;
            match message.expect("proxy closed the socket").unwrap() {
                Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(frame) => panic!("unexpected close: {frame:?}"),
                _ => {}
            }
        }
    }

    async fn expect_closed(&mut self) {
        loop {
            match timeout(WAIT, self.ws.next()).await.expect("socket not closed") {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    }
}

fn ltp(push: &Value) -> Decimal {
    serde_json::from_value(push["data"]["ltp"].clone()).unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn subscribe_then_receive_ticks() {
    let (url, mut upstream) = spawn_upstream().await;
    let proxy = start_proxy(&url, Duration::ZERO).await;
    let mut client = Client::login(proxy.addr).await;

    let reply = client.subscribe(&["INFY"], "LTP").await;
    assert_eq!(reply["status"], "success");
    assert_eq!(reply["mode"], "LTP");
    assert_eq!(reply["accepted"], json!([{"symbol": "INFY", "venue": "NSE"}]));

    let mut socket = timeout(WAIT, upstream.recv()).await.unwrap().unwrap();
    socket.expect_subscribe("INFY-EQ").await;
    socket.push_ticks("INFY-EQ", &["1500.5"]);

    let push = client.recv().await;
    assert_eq!(push["type"], "market_data");
    assert_eq!(push["symbol"], "INFY");
    assert_eq!(push["venue"], "NSE");
    assert_eq!(push["mode"], "LTP");
    assert_eq!(ltp(&push), Decimal::new(15005, 1));
    assert!(push["data"].get("open").is_none());
    assert!(push["data"].get("depth").is_none());
}

#[tokio::test]
async fn unknown_token_is_refused_and_closed() {
    let (url, _upstream) = spawn_upstream().await;
    let proxy = start_proxy(&url, Duration::ZERO).await;
    let mut client = Client::connect(proxy.addr).await;

    client
        .send(json!({"action": "authenticate", "token": "stolen"}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "auth");
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["code"], "AUTH_ERROR");

    client.expect_closed().await;
}

#[tokio::test]
async fn requests_before_authentication_are_refused() {
    let (url, _upstream) = spawn_upstream().await;
    let proxy = start_proxy(&url, Duration::ZERO).await;
    let mut client = Client::connect(proxy.addr).await;

    client
        .send(json!({"action": "subscribe", "symbols": [{"symbol": "INFY", "venue": "NSE"}], "mode": "LTP"}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply, json!({"type": "error", "code": "NOT_AUTHENTICATED"}));

    client.send_text("{not json".to_string()).await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "INVALID_MESSAGE");

    // The socket stays usable
    client
        .send(json!({"action": "authenticate", "api_key": "good-token"}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["status"], "success");
}

#[tokio::test]
async fn unknown_symbols_are_rejected_individually() {
    let (url, _upstream) = spawn_upstream().await;
    let proxy = start_proxy(&url, Duration::ZERO).await;
    let mut client = Client::login(proxy.addr).await;

    let reply = client.subscribe(&["INFY", "NOPE"], "QUOTE").await;
    assert_eq!(reply["status"], "partial");
    assert_eq!(reply["accepted"], json!([{"symbol": "INFY", "venue": "NSE"}]));
    assert_eq!(
        reply["rejected"],
        json!([{"symbol": "NOPE", "venue": "NSE", "reason": "UnknownSymbol"}])
    );
}

#[tokio::test]
async fn clients_share_one_routing_key() {
    let (url, mut upstream) = spawn_upstream().await;
    let proxy = start_proxy(&url, Duration::ZERO).await;

    let mut first = Client::login(proxy.addr).await;
    let mut second = Client::login(proxy.addr).await;
    first.subscribe(&["INFY"], "LTP").await;
    second.subscribe(&["infy"], "ltp").await;

    let mut socket = timeout(WAIT, upstream.recv()).await.unwrap().unwrap();
    socket.expect_subscribe("INFY-EQ").await;

    wait_until(|| {
        let health = proxy.health.read();
        health.clients == 2
            && health.routing_keys == 1
            && health.pools.first().is_some_and(|p| p.bound_symbols() == 1)
    })
    .await;

    socket.push_ticks("INFY-EQ", &["42"]);
    assert_eq!(ltp(&first.recv().await), Decimal::new(42, 0));
    assert_eq!(ltp(&second.recv().await), Decimal::new(42, 0));
}

#[tokio::test]
async fn bursts_are_throttled_per_key() {
    let (url, mut upstream) = spawn_upstream().await;
    let proxy = start_proxy(&url, Duration::from_millis(300)).await;
    let mut client = Client::login(proxy.addr).await;
    client.subscribe(&["INFY"], "LTP").await;

    let mut socket = timeout(WAIT, upstream.recv()).await.unwrap().unwrap();
    socket.expect_subscribe("INFY-EQ").await;

    socket.push_ticks("INFY-EQ", &["1", "2", "3"]);
    assert_eq!(ltp(&client.recv().await), Decimal::new(1, 0));
    assert!(client.recv_within(Duration::from_millis(150)).await.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    socket.push_ticks("INFY-EQ", &["4"]);
    assert_eq!(ltp(&client.recv().await), Decimal::new(4, 0));
}

#[tokio::test]
async fn upstream_reconnect_restores_subscriptions() {
    let (url, mut upstream) = spawn_upstream().await;
    let proxy = start_proxy(&url, Duration::ZERO).await;
    let mut client = Client::login(proxy.addr).await;
    client.subscribe(&["INFY"], "LTP").await;

    let mut socket = timeout(WAIT, upstream.recv()).await.unwrap().unwrap();
    socket.expect_subscribe("INFY-EQ").await;
    socket.push_ticks("INFY-EQ", &["100"]);
    assert_eq!(ltp(&client.recv().await), Decimal::new(100, 0));

    drop(socket);

    let mut socket = timeout(WAIT, upstream.recv()).await.unwrap().unwrap();
    socket.expect_subscribe("INFY-EQ").await;
    socket.push_ticks("INFY-EQ", &["101"]);
    assert_eq!(ltp(&client.recv().await), Decimal::new(101, 0));
}

#[tokio::test]
async fn ping_then_logout_closes_session() {
    let (url, _upstream) = spawn_upstream().await;
    let proxy = start_proxy(&url, Duration::ZERO).await;
    let mut client = Client::login(proxy.addr).await;

    client.send(json!({"action": "ping"})).await;
    assert_eq!(client.recv().await, json!({"type": "pong"}));

    client.send(json!({"action": "logout"})).await;
    assert_eq!(
        client.recv().await,
        json!({"type": "logout", "status": "success"})
    );
    client.expect_closed().await;

    wait_until(|| proxy.health.read().clients == 0).await;
}
