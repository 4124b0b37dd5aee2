//! WebSocket Feed Adapter
//!
//! [`BrokerAdapter`] over a provider's streaming WebSocket. Each adapter
//! instance is one pooled connection: a background task owns the socket,
//! and the adapter handle only records the bound set and forwards commands.
//!
//! # Connection Lifecycle
//!
//! - Connect (bounded by the connect timeout), then handshake
//! - On every successful authentication, re-subscribe the full bound set
//!   per mode and reset the backoff
//! - Heartbeat pings while connected; silence past the timeout reconnects
//! - Failures back off exponentially with jitter; once attempts run out
//!   the connection reports `Down` and the task ends
//!
//! Lifecycle changes are published on the sink's control lane; normalized
//! ticks go to its tick lane.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::auth::{AuthError, AuthHandler, AuthStep};
use super::backoff::{Backoff, BackoffConfig};
use super::codec::{CodecError, FeedCodec, WireFormat};
use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use super::messages::{FeedMessage, SubscriptionRequest, TickFrame};
use crate::application::ports::{
    AdapterContext, AdapterError, AdapterEvent, AdapterEventKind, BrokerAdapter, MarketEventSink,
    ProviderCredentials,
};
use crate::domain::market_data::{DepthLevel, Instrument, Mode, Tick};
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end one connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum FeedClientError {
    /// The socket did not open in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Provider rejected the handshake.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Nothing arrived within the heartbeat timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Provider closed the socket.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FeedClientError {
    /// Whether reconnecting can help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Auth(auth) => auth.is_retryable(),
            _ => true,
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::WebSocket(_) => "websocket",
            Self::Auth(_) => "auth",
            Self::Codec(_) => "codec",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ConnectionClosed => "closed",
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Per-provider connection settings shared by every pooled connection.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Frame encoding.
    pub wire: WireFormat,
    /// Bound on opening the socket.
    pub connect_timeout: Duration,
    /// Ping cadence and silence timeout.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect schedule.
    pub backoff: BackoffConfig,
}

impl FeedClientConfig {
    /// Settings with defaults for everything but the endpoint.
    #[must_use]
    pub fn new(url: impl Into<String>, wire: WireFormat) -> Self {
        Self {
            url: url.into(),
            wire,
            connect_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

// =============================================================================
// Bound Set
// =============================================================================

#[derive(Debug)]
struct BoundEntry {
    instrument: Instrument,
    modes: BTreeSet<Mode>,
}

/// What this connection streams, keyed by provider symbol.
#[derive(Debug, Default)]
struct BoundSet {
    symbols: HashMap<String, BoundEntry>,
}

impl BoundSet {
    /// Bind at `mode`; returns the provider symbols that were not bound
    /// at `mode` before.
    fn add(&mut self, instruments: &[Instrument], mode: Mode) -> Vec<String> {
        let mut added = Vec::new();
        for instrument in instruments {
            let fresh = self
                .symbols
                .entry(instrument.provider_symbol.clone())
                .or_insert_with(|| BoundEntry {
                    instrument: instrument.clone(),
                    modes: BTreeSet::new(),
                })
                .modes
                .insert(mode);
            if fresh {
                added.push(instrument.provider_symbol.clone());
            }
        }
        added
    }

    fn remove(&mut self, provider_symbols: &[String], mode: Mode) {
        for symbol in provider_symbols {
            if let Some(entry) = self.symbols.get_mut(symbol) {
                entry.modes.remove(&mode);
                if entry.modes.is_empty() {
                    self.symbols.remove(symbol);
                }
            }
        }
    }

    /// One subscribe request per mode covering everything bound.
    fn restore_requests(&self) -> Vec<SubscriptionRequest> {
        let mut per_mode: BTreeMap<Mode, Vec<String>> = BTreeMap::new();
        for (symbol, entry) in &self.symbols {
            for mode in &entry.modes {
                per_mode.entry(*mode).or_default().push(symbol.clone());
            }
        }
        per_mode
            .into_iter()
            .map(|(mode, mut symbols)| {
                symbols.sort();
                SubscriptionRequest::subscribe(mode, symbols)
            })
            .collect()
    }

    /// Fan a provider frame into one tick per bound mode it satisfies.
    fn normalize(&self, frame: &TickFrame) -> Vec<Tick> {
        let Some(entry) = self.symbols.get(&frame.symbol) else {
            return Vec::new();
        };
        let Some(last_price) = frame.last_price else {
            return Vec::new();
        };

        let modes: Vec<Mode> = match frame.mode {
            Some(mode) => entry.modes.get(&mode).copied().into_iter().collect(),
            None => entry.modes.iter().copied().collect(),
        };

        let timestamp = frame.timestamp.unwrap_or_else(Utc::now);
        let bids: Vec<DepthLevel> = frame.bids.iter().cloned().map(DepthLevel::from).collect();
        let asks: Vec<DepthLevel> = frame.asks.iter().cloned().map(DepthLevel::from).collect();

        modes
            .into_iter()
            .filter(|mode| frame.satisfies(*mode))
            .map(|mode| {
                let mut tick = Tick::ltp(entry.instrument.routing_key(mode), last_price, timestamp);
                if mode != Mode::Ltp {
                    tick.open = frame.open;
                    tick.high = frame.high;
                    tick.low = frame.low;
                    tick.close = frame.close;
                    tick.volume = frame.volume;
                }
                if mode == Mode::Depth {
                    tick.bids.clone_from(&bids);
                    tick.asks.clone_from(&asks);
                }
                tick
            })
            .collect()
    }
}

// =============================================================================
// Adapter Handle
// =============================================================================

#[derive(Debug)]
enum Command {
    Send(SubscriptionRequest),
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

/// One pooled provider connection.
pub struct WsFeedAdapter {
    config: Arc<FeedClientConfig>,
    context: AdapterContext,
    bound: Arc<RwLock<BoundSet>>,
    running: Option<Running>,
}

impl std::fmt::Debug for WsFeedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsFeedAdapter")
            .field("url", &self.config.url)
            .field("provider", &self.context.provider)
            .field("connection_index", &self.context.connection_index)
            .field("bound", &self.bound.read().symbols.len())
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl WsFeedAdapter {
    /// Create an unconnected adapter.
    #[must_use]
    pub fn new(config: Arc<FeedClientConfig>, context: AdapterContext) -> Self {
        Self {
            config,
            context,
            bound: Arc::new(RwLock::new(BoundSet::default())),
            running: None,
        }
    }

    /// Provider symbols currently bound, sorted.
    #[must_use]
    pub fn bound_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self.bound.read().symbols.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    fn commands(&self) -> Result<&mpsc::UnboundedSender<Command>, AdapterError> {
        let running = self.running.as_ref().ok_or(AdapterError::NotConnected)?;
        if running.commands.is_closed() {
            return Err(AdapterError::Closed);
        }
        Ok(&running.commands)
    }
}

impl BrokerAdapter for WsFeedAdapter {
    fn connect(&mut self, credentials: &ProviderCredentials) -> Result<(), AdapterError> {
        if self.running.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AdapterError::ConnectFailed(e.to_string()))?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let connection = FeedConnection {
            config: Arc::clone(&self.config),
            codec: FeedCodec::new(self.config.wire),
            credentials: credentials.clone(),
            provider: self.context.provider.clone(),
            index: self.context.connection_index,
            sink: Arc::clone(&self.context.sink),
            bound: Arc::clone(&self.bound),
            cancel: cancel.clone(),
        };
        runtime.spawn(connection.run(commands_rx));

        self.running = Some(Running {
            commands: commands_tx,
            cancel,
        });
        Ok(())
    }

    fn subscribe(&mut self, instruments: &[Instrument], mode: Mode) -> Result<(), AdapterError> {
        let commands = self.commands()?;
        let symbols = instruments.iter().map(|i| i.provider_symbol.clone()).collect();

        // The task drops commands seen before authentication and restores
        // the bound set instead, so the set must already hold them.
        let added = self.bound.write().add(instruments, mode);
        if commands
            .send(Command::Send(SubscriptionRequest::subscribe(mode, symbols)))
            .is_err()
        {
            self.bound.write().remove(&added, mode);
            return Err(AdapterError::Closed);
        }
        Ok(())
    }

    fn unsubscribe(&mut self, provider_symbols: &[String], mode: Mode) -> Result<(), AdapterError> {
        self.bound.write().remove(provider_symbols, mode);
        let commands = self.commands()?;
        commands
            .send(Command::Send(SubscriptionRequest::unsubscribe(
                mode,
                provider_symbols.to_vec(),
            )))
            .map_err(|_| AdapterError::Closed)
    }

    fn disconnect(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
        }
    }
}

impl Drop for WsFeedAdapter {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// =============================================================================
// Connection Task
// =============================================================================

struct FeedConnection {
    config: Arc<FeedClientConfig>,
    codec: FeedCodec,
    credentials: ProviderCredentials,
    provider: String,
    index: u32,
    sink: Arc<dyn MarketEventSink>,
    bound: Arc<RwLock<BoundSet>>,
    cancel: CancellationToken,
}

impl FeedConnection {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut backoff = Backoff::new(self.config.backoff);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut authenticated = false;
            let result = self
                .connect_and_run(&mut commands, &mut backoff, &mut authenticated)
                .await;

            let error = match result {
                Ok(()) => break,
                Err(e) => e,
            };

            tracing::warn!(
                provider = %self.provider,
                connection_index = self.index,
                error = %error,
                "Upstream connection error"
            );
            metrics::record_upstream_error(&self.provider, error.kind());

            if authenticated {
                self.emit(AdapterEventKind::Disconnected);
            }

            let delay = if error.is_retryable() {
                backoff.next_delay()
            } else {
                None
            };

            let Some(delay) = delay else {
                tracing::error!(
                    provider = %self.provider,
                    connection_index = self.index,
                    attempts = backoff.attempts(),
                    "Upstream connection down"
                );
                self.emit(AdapterEventKind::Down {
                    reason: error.to_string(),
                });
                return;
            };

            let attempt = backoff.attempts();
            tracing::info!(
                provider = %self.provider,
                connection_index = self.index,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting upstream"
            );
            metrics::record_upstream_reconnect(&self.provider);
            self.emit(AdapterEventKind::Reconnecting { attempt });

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(
            provider = %self.provider,
            connection_index = self.index,
            "Upstream connection closed"
        );
    }

    /// One socket's lifetime. `Ok` means the connection was asked to stop.
    async fn connect_and_run(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        backoff: &mut Backoff,
        authenticated: &mut bool,
    ) -> Result<(), FeedClientError> {
        tracing::debug!(
            provider = %self.provider,
            connection_index = self.index,
            url = %self.config.url,
            "Connecting upstream"
        );

        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(self.config.connect_timeout, connect) => {
                result.map_err(|_| FeedClientError::ConnectTimeout(self.config.connect_timeout))??
            }
        };

        let (mut write, mut read) = stream.split();
        let mut auth = AuthHandler::new(self.credentials.clone());
        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat, Instant::now());

        let period = heartbeat.interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ticker.tick() => match heartbeat.poll(Instant::now()) {
                    HeartbeatAction::SendPing => write.send(Message::Ping(Vec::new().into())).await?,
                    HeartbeatAction::Timeout => return Err(FeedClientError::HeartbeatTimeout),
                },
                command = commands.recv() => match command {
                    // Before authentication the bound set is restored in full
                    Some(Command::Send(request)) => {
                        if auth.is_authenticated() {
                            self.send(&mut write, &request).await?;
                        }
                    }
                    None => return Ok(()),
                },
                frame = read.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(FeedClientError::ConnectionClosed),
                    };
                    heartbeat.record_activity(Instant::now());

                    match message {
                        Message::Ping(data) => write.send(Message::Pong(data)).await?,
                        Message::Close(_) => return Err(FeedClientError::ConnectionClosed),
                        Message::Text(_) | Message::Binary(_) => {
                            for decoded in self.codec.decode(&message)? {
                                self.handle(decoded, &mut auth, &mut write, backoff, authenticated)
                                    .await?;
                            }
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    async fn handle<W>(
        &self,
        message: FeedMessage,
        auth: &mut AuthHandler,
        write: &mut W,
        backoff: &mut Backoff,
        authenticated: &mut bool,
    ) -> Result<(), FeedClientError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        match message {
            FeedMessage::Success(frame) => match auth.on_success(&frame) {
                AuthStep::SendCredentials(request) => self.send(write, &request).await?,
                AuthStep::Authenticated => {
                    *authenticated = true;
                    backoff.reset();
                    tracing::info!(
                        provider = %self.provider,
                        connection_index = self.index,
                        "Upstream authenticated"
                    );
                    self.emit(AdapterEventKind::Connected);

                    let requests = self.bound.read().restore_requests();
                    for request in &requests {
                        self.send(write, request).await?;
                    }
                }
                AuthStep::Ignore => {}
            },
            FeedMessage::Error(frame) => {
                if !auth.is_authenticated() {
                    return Err(auth.on_error(&frame).into());
                }
                tracing::warn!(
                    provider = %self.provider,
                    connection_index = self.index,
                    code = frame.code,
                    msg = %frame.msg,
                    "Upstream error frame"
                );
                metrics::record_upstream_error(&self.provider, "provider_frame");
                self.emit(AdapterEventKind::Error { message: frame.msg });
            }
            FeedMessage::Subscription(frame) => {
                tracing::debug!(
                    provider = %self.provider,
                    connection_index = self.index,
                    ltp = frame.ltp.len(),
                    quote = frame.quote.len(),
                    depth = frame.depth.len(),
                    "Upstream subscription confirmed"
                );
            }
            FeedMessage::Tick(frame) => {
                if !auth.is_authenticated() {
                    return Ok(());
                }
                let ticks = self.bound.read().normalize(&frame);
                for tick in ticks {
                    self.sink.publish_tick(tick);
                }
            }
        }
        Ok(())
    }

    async fn send<W, T>(&self, write: &mut W, frame: &T) -> Result<(), FeedClientError>
    where
        W: Sink<Message, Error = tungstenite::Error> + Unpin,
        T: Serialize,
    {
        let message = self.codec.encode(frame)?;
        write.send(message).await?;
        Ok(())
    }

    fn emit(&self, kind: AdapterEventKind) {
        self.sink.publish_event(AdapterEvent {
            provider: self.provider.clone(),
            connection_index: self.index,
            kind,
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use tokio::net::TcpListener;

    use super::*;
    use crate::domain::market_data::RoutingKey;
    use crate::infrastructure::feed::messages::LevelFrame;

    fn instrument(symbol: &str) -> Instrument {
        Instrument::new(symbol, "NSE", format!("{symbol}-EQ"))
    }

    fn quote_frame(symbol: &str) -> TickFrame {
        let mut frame = TickFrame::last_price(symbol, Decimal::new(100, 0));
        frame.open = Some(Decimal::new(99, 0));
        frame.high = Some(Decimal::new(101, 0));
        frame.low = Some(Decimal::new(98, 0));
        frame.close = Some(Decimal::new(97, 0));
        frame.volume = Some(10);
        frame
    }

    #[test]
    fn normalize_fans_out_per_bound_mode() {
        let mut bound = BoundSet::default();
        bound.add(&[instrument("INFY")], Mode::Ltp);
        bound.add(&[instrument("INFY")], Mode::Quote);
        bound.add(&[instrument("INFY")], Mode::Depth);

        let ticks = bound.normalize(&quote_frame("INFY-EQ"));

        // No ladders, so DEPTH is not satisfied
        let keys: Vec<_> = ticks.iter().map(|t| t.key.clone()).collect();
        assert_eq!(
            keys,
            vec![
                RoutingKey::new("INFY", "NSE", Mode::Ltp),
                RoutingKey::new("INFY", "NSE", Mode::Quote),
            ]
        );
        assert!(ticks[0].open.is_none());
        assert!(ticks[1].has_ohlc());
    }

    #[test]
    fn normalize_honours_frame_mode() {
        let mut bound = BoundSet::default();
        bound.add(&[instrument("INFY")], Mode::Ltp);
        bound.add(&[instrument("INFY")], Mode::Depth);

        let mut frame = quote_frame("INFY-EQ");
        frame.mode = Some(Mode::Depth);
        frame.bids = vec![LevelFrame {
            price: Decimal::new(99, 0),
            quantity: 5,
            orders: None,
        }];

        let ticks = bound.normalize(&frame);
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].key.mode(), Mode::Depth);
        assert_eq!(ticks[0].bids.len(), 1);
        assert!(ticks[0].has_ohlc());
    }

    #[test]
    fn normalize_ignores_unbound_symbols_and_modes() {
        let mut bound = BoundSet::default();
        bound.add(&[instrument("INFY")], Mode::Ltp);

        assert!(bound.normalize(&quote_frame("TCS-EQ")).is_empty());

        let mut frame = quote_frame("INFY-EQ");
        frame.mode = Some(Mode::Quote);
        assert!(bound.normalize(&frame).is_empty());
    }

    #[test]
    fn restore_groups_by_mode() {
        let mut bound = BoundSet::default();
        bound.add(&[instrument("TCS"), instrument("INFY")], Mode::Ltp);
        bound.add(&[instrument("INFY")], Mode::Depth);
        bound.remove(&["TCS-EQ".to_string()], Mode::Ltp);

        let requests = bound.restore_requests();
        assert_eq!(
            requests,
            vec![
                SubscriptionRequest::subscribe(Mode::Ltp, vec!["INFY-EQ".into()]),
                SubscriptionRequest::subscribe(Mode::Depth, vec!["INFY-EQ".into()]),
            ]
        );
    }

    // -------------------------------------------------------------------------
    // Against a local provider
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct Recorder {
        ticks: Mutex<Vec<Tick>>,
        events: Mutex<Vec<AdapterEventKind>>,
    }

    impl MarketEventSink for Recorder {
        fn publish_tick(&self, tick: Tick) {
            self.ticks.lock().push(tick);
        }
        fn publish_event(&self, event: AdapterEvent) {
            self.events.lock().push(event.kind);
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn adapter(url: String, sink: Arc<Recorder>, backoff: BackoffConfig) -> WsFeedAdapter {
        let config = FeedClientConfig {
            backoff,
            connect_timeout: Duration::from_secs(1),
            ..FeedClientConfig::new(url, WireFormat::Json)
        };
        WsFeedAdapter::new(
            Arc::new(config),
            AdapterContext {
                provider: "kite".into(),
                connection_index: 0,
                sink,
            },
        )
    }

    #[tokio::test]
    async fn handshake_subscribe_and_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::text(r#"[{"T":"success","msg":"connected"}]"#))
                .await
                .unwrap();

            let auth = ws.next().await.unwrap().unwrap().into_text().unwrap().as_str().to_owned();
            assert!(auth.contains(r#""action":"auth""#));
            ws.send(Message::text(r#"[{"T":"success","msg":"authenticated"}]"#))
                .await
                .unwrap();

            let subscribe = ws.next().await.unwrap().unwrap().into_text().unwrap().as_str().to_owned();
            assert!(subscribe.contains(r#""symbols":["INFY-EQ"]"#), "{subscribe}");
            ws.send(Message::text(r#"[{"T":"tick","S":"INFY-EQ","lp":1500}]"#))
                .await
                .unwrap();

            // Hold the socket open until the client closes it
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        });

        let recorder = Arc::new(Recorder::default());
        let mut adapter = adapter(url, Arc::clone(&recorder), BackoffConfig::default());
        adapter.connect(&ProviderCredentials::new("k", "s")).unwrap();
        adapter.subscribe(&[instrument("INFY")], Mode::Ltp).unwrap();

        wait_until(|| !recorder.ticks.lock().is_empty()).await;
        let tick = recorder.ticks.lock()[0].clone();
        assert_eq!(tick.key, RoutingKey::new("INFY", "NSE", Mode::Ltp));
        assert_eq!(tick.last_price, Decimal::new(1500, 0));
        assert_eq!(recorder.events.lock()[0], AdapterEventKind::Connected);

        adapter.disconnect();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn subscribe_before_authentication_is_restored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (auth_seen_tx, auth_seen_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            ws.send(Message::text(r#"[{"T":"success","msg":"connected"}]"#))
                .await
                .unwrap();

            let auth = ws.next().await.unwrap().unwrap();
            assert!(auth.into_text().unwrap().as_str().contains(r#""action":"auth""#));
            auth_seen_tx.send(()).unwrap();

            // Hold authentication until the subscribe has been issued
            release_rx.await.unwrap();
            ws.send(Message::text(r#"[{"T":"success","msg":"authenticated"}]"#))
                .await
                .unwrap();

            let subscribe = ws.next().await.unwrap().unwrap().into_text().unwrap().as_str().to_owned();
            assert!(subscribe.contains(r#""action":"subscribe""#), "{subscribe}");
            assert!(subscribe.contains(r#""INFY-EQ""#), "{subscribe}");
            ws.send(Message::text(r#"[{"T":"tick","S":"INFY-EQ","lp":1500}]"#))
                .await
                .unwrap();

            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        });

        let recorder = Arc::new(Recorder::default());
        let mut adapter = adapter(url, Arc::clone(&recorder), BackoffConfig::default());
        adapter.connect(&ProviderCredentials::new("k", "s")).unwrap();

        auth_seen_rx.await.unwrap();
        adapter.subscribe(&[instrument("INFY")], Mode::Ltp).unwrap();
        assert_eq!(adapter.bound_symbols(), vec!["INFY-EQ".to_string()]);
        release_tx.send(()).unwrap();

        wait_until(|| !recorder.ticks.lock().is_empty()).await;
        assert_eq!(
            recorder.ticks.lock()[0].key,
            RoutingKey::new("INFY", "NSE", Mode::Ltp)
        );

        adapter.disconnect();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn add_reports_only_new_bindings() {
        let mut bound = BoundSet::default();
        assert_eq!(bound.add(&[instrument("INFY")], Mode::Ltp), vec!["INFY-EQ".to_string()]);
        assert_eq!(
            bound.add(&[instrument("INFY"), instrument("TCS")], Mode::Ltp),
            vec!["TCS-EQ".to_string()]
        );

        // Rolling back the new binding keeps the earlier one
        bound.remove(&["TCS-EQ".to_string()], Mode::Ltp);
        assert_eq!(bound.symbols.len(), 1);
    }

    #[tokio::test]
    async fn reports_down_after_exhausting_attempts() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let recorder = Arc::new(Recorder::default());
        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 2,
        };
        let mut adapter = adapter(format!("ws://127.0.0.1:{port}"), Arc::clone(&recorder), backoff);
        adapter.connect(&ProviderCredentials::new("k", "s")).unwrap();

        wait_until(|| {
            recorder
                .events
                .lock()
                .iter()
                .any(|e| matches!(e, AdapterEventKind::Down { .. }))
        })
        .await;

        let events = recorder.events.lock().clone();
        assert_eq!(events[0], AdapterEventKind::Reconnecting { attempt: 1 });
        assert_eq!(events[1], AdapterEventKind::Reconnecting { attempt: 2 });
        assert!(matches!(events[2], AdapterEventKind::Down { .. }));
    }

    #[test]
    fn commands_before_connect_fail() {
        let recorder = Arc::new(Recorder::default());
        let mut adapter = adapter("ws://127.0.0.1:1".into(), recorder, BackoffConfig::default());
        assert_eq!(
            adapter.subscribe(&[instrument("INFY")], Mode::Ltp),
            Err(AdapterError::NotConnected)
        );
        assert!(adapter.bound_symbols().is_empty());
    }
}
