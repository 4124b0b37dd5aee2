//! Environment credential store.
//!
//! Reads `MDPROXY_PROVIDER_<NAME>_API_KEY` and `MDPROXY_PROVIDER_<NAME>_API_SECRET`
//! on every lookup, so rotated values apply to the next connection a pool
//! opens.

use std::sync::Arc;

use crate::application::ports::{CredentialStore, LookupError, ProviderCredentials};

type Lookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Credential store backed by environment variables.
#[derive(Clone)]
pub struct EnvCredentialStore {
    lookup: Arc<Lookup>,
}

impl EnvCredentialStore {
    /// Read from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Read through a custom lookup function.
    #[must_use]
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var(&self, provider: &str, suffix: &str) -> Option<String> {
        let key = format!("MDPROXY_PROVIDER_{}_{suffix}", provider.to_uppercase());
        (self.lookup)(&key).filter(|v| !v.is_empty())
    }
}

impl std::fmt::Debug for EnvCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvCredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore for EnvCredentialStore {
    fn get_credentials(&self, provider: &str) -> Result<ProviderCredentials, LookupError> {
        let missing = || LookupError::MissingCredentials(provider.to_string());
        let api_key = self.var(provider, "API_KEY").ok_or_else(missing)?;
        let api_secret = self.var(provider, "API_SECRET").ok_or_else(missing)?;
        Ok(ProviderCredentials::new(api_key, api_secret))
    }
}
