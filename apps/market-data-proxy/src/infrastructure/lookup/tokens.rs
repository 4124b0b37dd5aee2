//! Static token validation.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::application::ports::{Identity, IdentityError, IdentityValidator};

/// Validates tokens against a fixed table loaded at startup.
#[derive(Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    /// Create a validator from `token -> user_id` entries.
    #[must_use]
    pub const fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Number of accepted tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no token is accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl std::fmt::Debug for StaticTokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenValidator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

#[async_trait]
impl IdentityValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<Identity, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::InvalidToken);
        }
        self.tokens
            .get(token)
            .map(|user_id| Identity {
                user_id: user_id.clone(),
            })
            .ok_or(IdentityError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> StaticTokenValidator {
        StaticTokenValidator::new(HashMap::from([
            ("tok-a".to_string(), "alice".to_string()),
            ("tok-b".to_string(), "bob".to_string()),
        ]))
    }

    #[tokio::test]
    async fn known_token_resolves_user() {
        let identity = validator().validate("tok-b").await.unwrap();
        assert_eq!(identity.user_id, "bob");
    }

    #[tokio::test]
    async fn unknown_or_empty_token_rejected() {
        let v = validator();
        assert_eq!(v.validate("nope").await, Err(IdentityError::InvalidToken));
        assert_eq!(v.validate("").await, Err(IdentityError::InvalidToken));
    }

    #[test]
    fn debug_hides_tokens() {
        let rendered = format!("{:?}", validator());
        assert!(!rendered.contains("tok-a"));
        assert!(rendered.contains('2'));
    }
}
