//! Client Listener
//!
//! Accepts TCP connections and spawns one [`handle_client`] task per socket.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use super::connection::{ConnectionContext, ConnectionError, handle_client};

/// WebSocket listener for market data clients.
#[derive(Debug)]
pub struct ProxyServer {
    listener: TcpListener,
    context: ConnectionContext,
}

impl ProxyServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::BindFailed` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, context: ConnectionContext) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e.to_string()))?;
        Ok(Self { listener, context })
    }

    /// Address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Io(e.to_string()))
    }

    /// Accept connections until cancelled.
    pub async fn run(self) {
        let cancel = self.context.cancel.clone();
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "Proxy server listening");
        }

        loop {
            let (stream, peer) = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept client connection");
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let context = self.context.clone();
            tokio::spawn(async move {
                match handle_client(stream, peer, context).await {
                    Ok(()) => {}
                    Err(ConnectionError::WebSocket(e)) => {
                        tracing::debug!(%peer, error = %e, "Client connection failed");
                    }
                    Err(e) => tracing::warn!(%peer, error = %e, "Client connection ended"),
                }
            });
        }

        tracing::info!("Proxy server stopped");
    }
}

/// Listener errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind.
    #[error("failed to bind {0}: {1}")]
    BindFailed(SocketAddr, String),

    /// Socket error.
    #[error("socket error: {0}")]
    Io(String),
}
