//! Upstream Authentication
//!
//! Provider handshake state machine.
//!
//! # Flow
//!
//! 1. Connect to the WebSocket endpoint
//! 2. Receive `{"T":"success","msg":"connected"}`
//! 3. Send `{"action":"auth","key":"...","secret":"..."}`
//! 4. Receive `{"T":"success","msg":"authenticated"}` or an error frame
//!
//! # Error Codes
//!
//! - 401: Not authenticated
//! - 402: Authentication failed (invalid credentials)
//! - 403: Already authenticated
//! - 404: Authentication timeout
//! - 406: Connection limit exceeded

use super::messages::{AuthRequest, ErrorFrame, SuccessFrame, SuccessKind};
use crate::application::ports::ProviderCredentials;

/// Handshake failures reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Request sent before authenticating.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Credentials rejected.
    #[error("authentication failed: invalid API key or secret")]
    InvalidCredentials,

    /// Credentials sent twice.
    #[error("already authenticated")]
    AlreadyAuthenticated,

    /// Credentials not sent in time.
    #[error("authentication timeout")]
    Timeout,

    /// Too many concurrent connections for the account.
    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,

    /// Any other provider error.
    #[error("provider error ({code}): {message}")]
    Provider {
        /// Provider error code.
        code: i32,
        /// Provider message.
        message: String,
    },
}

impl AuthError {
    /// Whether retrying with the same credentials can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidCredentials)
    }
}

impl From<&ErrorFrame> for AuthError {
    fn from(frame: &ErrorFrame) -> Self {
        match frame.code {
            401 => Self::NotAuthenticated,
            402 => Self::InvalidCredentials,
            403 => Self::AlreadyAuthenticated,
            404 => Self::Timeout,
            406 => Self::ConnectionLimitExceeded,
            code => Self::Provider {
                code,
                message: frame.msg.clone(),
            },
        }
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Socket not yet accepted.
    #[default]
    Disconnected,
    /// Auth frame sent, waiting for the verdict.
    Authenticating,
    /// Ready for subscriptions.
    Authenticated,
    /// Provider refused the credentials.
    Failed,
}

/// What the caller must do after a success frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this auth frame.
    SendCredentials(AuthRequest),
    /// The connection is now authenticated.
    Authenticated,
    /// Nothing to do.
    Ignore,
}

/// Drives one connection's handshake.
#[derive(Debug)]
pub struct AuthHandler {
    credentials: ProviderCredentials,
    state: AuthState,
}

impl AuthHandler {
    /// Create a handler for a fresh connection.
    #[must_use]
    pub const fn new(credentials: ProviderCredentials) -> Self {
        Self {
            credentials,
            state: AuthState::Disconnected,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Whether subscriptions may be sent.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated)
    }

    /// Advance on a success frame.
    pub fn on_success(&mut self, frame: &SuccessFrame) -> AuthStep {
        match (frame.msg, self.state) {
            (SuccessKind::Connected, AuthState::Disconnected) => {
                self.state = AuthState::Authenticating;
                AuthStep::SendCredentials(AuthRequest::new(
                    self.credentials.api_key(),
                    self.credentials.api_secret(),
                ))
            }
            (SuccessKind::Authenticated, AuthState::Authenticating) => {
                self.state = AuthState::Authenticated;
                AuthStep::Authenticated
            }
            _ => AuthStep::Ignore,
        }
    }

    /// Record an error frame received before authentication completed.
    pub fn on_error(&mut self, frame: &ErrorFrame) -> AuthError {
        self.state = AuthState::Failed;
        AuthError::from(frame)
    }
}
