//! Lookup Ports (Driven Ports)
//!
//! External collaborators the proxy consults but does not own: identity
//! validation, symbol resolution and provider credentials.

use async_trait::async_trait;

use super::broker_port::ProviderCredentials;

/// An authenticated client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User the token belongs to.
    pub user_id: String,
}

/// Identity validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// The token is unknown, expired or malformed.
    #[error("invalid token")]
    InvalidToken,

    /// The validator could not be reached.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

/// Validates client tokens.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    /// Validate a token and return the identity it carries.
    async fn validate(&self, token: &str) -> Result<Identity, IdentityError>;
}

/// Where a client-facing symbol lives upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    /// Provider that owns the symbol.
    pub provider_name: String,
    /// Symbol as the provider knows it.
    pub provider_symbol: String,
}

/// Maps client-facing `(symbol, venue)` pairs to provider symbols.
pub trait SymbolResolver: Send + Sync {
    /// Resolve a symbol. Returns `None` when the pair is unknown.
    fn resolve(&self, symbol: &str, venue: &str) -> Option<ResolvedSymbol>;
}

/// Lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// No credentials configured for the provider.
    #[error("no credentials for provider {0}")]
    MissingCredentials(String),

    /// The symbol master could not be read.
    #[error("symbol master unreadable: {0}")]
    SymbolMaster(String),
}

/// Supplies adapter connect parameters.
pub trait CredentialStore: Send + Sync {
    /// Credentials for a provider.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::MissingCredentials` if none are configured.
    fn get_credentials(&self, provider: &str) -> Result<ProviderCredentials, LookupError>;
}
