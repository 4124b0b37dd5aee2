//! Client Connection Task
//!
//! One task per accepted socket. The task authenticates the client, then
//! splits the socket: a writer task drains the session's outbound queue and
//! the reader forwards requests to the event loop as [`ServerCommand`]s.
//! Routing state is never touched here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientRequest, ErrorCode, ServerFrame, encode_outbound};
use crate::application::ports::{
    Identity, IdentityError, IdentityValidator, Outbound, Reply, SubscriptionItem,
};
use crate::domain::market_data::Mode;
use crate::domain::subscription::ClientId;

/// Frames the reader may queue for the writer outside the session queue.
const CONTROL_QUEUE: usize = 32;

// =============================================================================
// Commands
// =============================================================================

/// Requests forwarded from connection tasks to the event loop.
#[derive(Debug)]
pub enum ServerCommand {
    /// Create a session.
    Register {
        /// New session id.
        client_id: ClientId,
        /// Authenticated identity.
        user_id: String,
        /// Session outbound queue.
        sink: mpsc::Sender<Outbound>,
    },
    /// Subscribe request.
    Subscribe {
        /// Session.
        client_id: ClientId,
        /// Requested pairs.
        items: Vec<SubscriptionItem>,
        /// Requested mode.
        mode: Mode,
    },
    /// Unsubscribe request.
    Unsubscribe {
        /// Session.
        client_id: ClientId,
        /// Pairs to drop.
        items: Vec<SubscriptionItem>,
        /// Mode to drop, or all.
        mode: Option<Mode>,
    },
    /// Logout request.
    Logout {
        /// Session.
        client_id: ClientId,
    },
    /// Application ping.
    Ping {
        /// Session.
        client_id: ClientId,
    },
    /// Socket closed or failed.
    Disconnect {
        /// Session.
        client_id: ClientId,
    },
}

// =============================================================================
// Context
// =============================================================================

/// Everything a connection task needs, shared across connections.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Token validator.
    pub validator: Arc<dyn IdentityValidator>,
    /// Event loop command queue.
    pub commands: mpsc::Sender<ServerCommand>,
    /// Session outbound queue capacity.
    pub queue_capacity: usize,
    /// Time allowed to authenticate.
    pub auth_timeout: Duration,
    /// Process shutdown.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("queue_capacity", &self.queue_capacity)
            .field("auth_timeout", &self.auth_timeout)
            .finish_non_exhaustive()
    }
}

/// Connection-level errors. Each one ends only its own connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// WebSocket handshake or transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The event loop is gone.
    #[error("event loop unavailable")]
    EventLoopClosed,
}

// =============================================================================
// Connection Handler
// =============================================================================

/// Serve one client socket until it closes.
///
/// # Errors
///
/// Returns `ConnectionError` on a failed handshake or when the event loop
/// has stopped. Authentication failures close the socket and return `Ok`.
pub async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    context: ConnectionContext,
) -> Result<(), ConnectionError> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    tracing::debug!(%peer, "Client WebSocket handshake complete");

    // The deadline covers reading the token and validating it
    let auth = authenticate(&mut ws, context.validator.as_ref());
    let identity = match tokio::time::timeout(context.auth_timeout, auth).await {
        Ok(Some(Ok(identity))) => identity,
        Ok(Some(Err(e))) => {
            reject(&mut ws, &e).await;
            tracing::info!(%peer, error = %e, "Client authentication failed");
            return Ok(());
        }
        Ok(None) => {
            tracing::debug!(%peer, "Client left before authenticating");
            return Ok(());
        }
        Err(_) => {
            tracing::info!(%peer, "Client authentication timed out");
            let _ = ws.close(None).await;
            return Ok(());
        }
    };

    run_session(ws, peer, identity, &context).await
}

/// Wait for an `authenticate` request and validate its token.
///
/// Returns `None` if the socket closes first.
async fn authenticate(
    ws: &mut WebSocketStream<TcpStream>,
    validator: &dyn IdentityValidator,
) -> Option<Result<Identity, IdentityError>> {
    let token = read_token(ws).await?;
    Some(validator.validate(&token).await)
}

/// Wait for an `authenticate` request and return its token.
///
/// Other requests are answered with `NOT_AUTHENTICATED`. Returns `None` if
/// the socket closes first.
async fn read_token(ws: &mut WebSocketStream<TcpStream>) -> Option<String> {
    while let Some(frame) = ws.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };

        let reply = match ClientRequest::parse(text.as_str()) {
            Ok(ClientRequest::Authenticate { token }) => return Some(token),
            Ok(_) => ServerFrame::error(ErrorCode::NotAuthenticated, None),
            Err(e) => ServerFrame::error(ErrorCode::InvalidMessage, Some(e.to_string())),
        };
        if let Ok(json) = reply.to_json()
            && ws.send(Message::text(json)).await.is_err()
        {
            return None;
        }
    }
    None
}

async fn reject(ws: &mut WebSocketStream<TcpStream>, error: &IdentityError) {
    if let Ok(json) = ServerFrame::auth_error(error.to_string()).to_json() {
        let _ = ws.send(Message::text(json)).await;
    }
    let _ = ws.close(None).await;
}

async fn run_session(
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    identity: Identity,
    context: &ConnectionContext,
) -> Result<(), ConnectionError> {
    let client_id = ClientId::generate();
    let (sink, outbound) = mpsc::channel(context.queue_capacity);
    context
        .commands
        .send(ServerCommand::Register {
            client_id,
            user_id: identity.user_id.clone(),
            sink,
        })
        .await
        .map_err(|_| ConnectionError::EventLoopClosed)?;

    tracing::info!(%peer, client_id = %client_id, user_id = %identity.user_id, "Client authenticated");

    let (write, read) = ws.split();
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
    let writer = tokio::spawn(write_loop(write, outbound, control_rx, client_id));

    let result = read_loop(read, client_id, context, &control_tx).await;

    // Idempotent after a logout
    let _ = context
        .commands
        .send(ServerCommand::Disconnect { client_id })
        .await;
    drop(control_tx);

    if let Err(e) = writer.await {
        tracing::warn!(client_id = %client_id, error = %e, "Client writer task failed");
    }
    tracing::info!(%peer, client_id = %client_id, "Client disconnected");
    result
}

/// Forward requests until the socket closes, the client logs out, or the
/// process shuts down.
async fn read_loop<R>(
    mut read: R,
    client_id: ClientId,
    context: &ConnectionContext,
    control: &mpsc::Sender<String>,
) -> Result<(), ConnectionError>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = context.cancel.cancelled() => return Ok(()),
            () = control.closed() => return Ok(()),
            frame = read.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                send_control(
                    control,
                    &ServerFrame::error(
                        ErrorCode::InvalidMessage,
                        Some("binary frames are not supported".to_string()),
                    ),
                )
                .await;
                continue;
            }
            // Ping frames are answered by tungstenite on the next read
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Err(e)) => {
                tracing::debug!(client_id = %client_id, error = %e, "Client read error");
                return Ok(());
            }
        };

        let command = match ClientRequest::parse(text.as_str()) {
            Ok(ClientRequest::Subscribe { symbols, mode }) => ServerCommand::Subscribe {
                client_id,
                items: symbols.into_iter().map(SubscriptionItem::from).collect(),
                mode,
            },
            Ok(ClientRequest::Unsubscribe { symbols, mode }) => ServerCommand::Unsubscribe {
                client_id,
                items: symbols.into_iter().map(SubscriptionItem::from).collect(),
                mode,
            },
            Ok(ClientRequest::Logout) => ServerCommand::Logout { client_id },
            Ok(ClientRequest::Ping) => ServerCommand::Ping { client_id },
            Ok(ClientRequest::Authenticate { .. }) => {
                send_control(
                    control,
                    &ServerFrame::error(
                        ErrorCode::InvalidMessage,
                        Some("already authenticated".to_string()),
                    ),
                )
                .await;
                continue;
            }
            Err(e) => {
                send_control(
                    control,
                    &ServerFrame::error(ErrorCode::InvalidMessage, Some(e.to_string())),
                )
                .await;
                continue;
            }
        };

        let logout = matches!(command, ServerCommand::Logout { .. });
        context
            .commands
            .send(command)
            .await
            .map_err(|_| ConnectionError::EventLoopClosed)?;
        if logout {
            return Ok(());
        }
    }
}

async fn send_control(control: &mpsc::Sender<String>, frame: &ServerFrame<'_>) {
    match frame.to_json() {
        Ok(json) => {
            let _ = control.send(json).await;
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode control frame"),
    }
}

/// Write queued messages until the session ends.
///
/// The session ends when the core drops its sink or after a logout
/// acknowledgement has been written. A write failure closes the outbound
/// queue, which the core treats as a disconnect on its next push.
async fn write_loop<W>(
    mut write: W,
    mut outbound: mpsc::Receiver<Outbound>,
    mut control: mpsc::Receiver<String>,
    client_id: ClientId,
) where
    W: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut control_open = true;
    loop {
        let (text, last) = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    let last = matches!(message, Outbound::Reply(Reply::LoggedOut));
                    match encode_outbound(&message) {
                        Ok(text) => (text, last),
                        Err(e) => {
                            tracing::warn!(client_id = %client_id, error = %e, "Failed to encode frame");
                            continue;
                        }
                    }
                }
                None => break,
            },
            text = control.recv(), if control_open => match text {
                Some(text) => (text, false),
                None => {
                    control_open = false;
                    continue;
                }
            },
        };

        if let Err(e) = write.send(Message::text(text)).await {
            tracing::debug!(client_id = %client_id, error = %e, "Client write failed");
            return;
        }
        if last {
            break;
        }
    }

    let _ = write.send(Message::Close(None)).await;
    let _ = write.close().await;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::net::TcpListener;

    use super::*;

    /// Never answers.
    struct StalledValidator;

    #[async_trait]
    impl IdentityValidator for StalledValidator {
        async fn validate(&self, _token: &str) -> Result<Identity, IdentityError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_validation_hits_auth_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (commands, mut commands_rx) = mpsc::channel(4);
        let context = ConnectionContext {
            validator: Arc::new(StalledValidator),
            commands,
            queue_capacity: 8,
            auth_timeout: Duration::from_millis(100),
            cancel: CancellationToken::new(),
        };

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_client(stream, peer, context).await
        });

        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        client
            .send(Message::text(r#"{"action":"authenticate","token":"slow"}"#))
            .await
            .unwrap();

        // The server closes the socket once the deadline passes
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "socket still open after the auth timeout");

        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(commands_rx.try_recv().is_err(), "no session may be registered");
    }
}
