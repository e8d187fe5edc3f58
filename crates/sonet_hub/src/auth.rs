//! Authentication is delegated to the identity service through this
//! predicate; the hub never sees credentials beyond the opaque token.

use async_trait::async_trait;

#[async_trait]
pub trait AuthPredicate: Send + Sync {
    async fn authenticate(&self, user_id: &str, session_token: &str) -> bool;
}

/// Accept-everything predicate for tests and local development.
pub struct AllowAll;

#[async_trait]
impl AuthPredicate for AllowAll {
    async fn authenticate(&self, _user_id: &str, _session_token: &str) -> bool {
        true
    }
}

/// Static token table; the simplest real predicate.
pub struct StaticTokens {
    pub tokens: std::collections::HashMap<String, String>,
}

#[async_trait]
impl AuthPredicate for StaticTokens {
    async fn authenticate(&self, user_id: &str, session_token: &str) -> bool {
        self.tokens.get(user_id).is_some_and(|t| t == session_token)
    }
}
