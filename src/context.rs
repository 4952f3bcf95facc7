//! The request capability schemes read credentials from.
//!
//! Schemes only need three things from the host: a header, an input field
//! and a session. `RequestContext` is that contract; `http::HttpRequestContext`
//! implements it for axum and `MemoryContext` for CLI use and tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{AuthError, AuthResult};

/// Per-request view of the host framework.
#[async_trait]
pub trait RequestContext: Send + Sync {
    /// Header value by case-insensitive name.
    fn header(&self, name: &str) -> Option<String>;

    /// Query or body field by name.
    fn input(&self, name: &str) -> Option<String>;

    /// Read a session value. Requests without a session read as empty.
    async fn session_get(&self, key: &str) -> AuthResult<Option<Value>>;

    async fn session_put(&self, key: &str, value: Value) -> AuthResult<()>;

    async fn session_forget(&self, key: &str) -> AuthResult<()>;
}

/// Bearer value from `Authorization: Bearer <token>`, else the `token` input.
pub fn bearer_token(ctx: &dyn RequestContext) -> Option<String> {
    let from_header = ctx.header("authorization").and_then(|value| {
        let (scheme, token) = value.trim().split_once(' ')?;
        let token = token.trim();
        (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
    });

    from_header.or_else(|| ctx.input("token").filter(|token| !token.is_empty()))
}

/// Shared handle to one client's session data.
///
/// Session storage itself belongs to the host; the host attaches a handle to
/// each request and persists it however it likes.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    data: Arc<RwLock<HashMap<String, Value>>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.data.read().await.get(key).cloned()
    }

    pub async fn put(&self, key: impl Into<String>, value: Value) {
        self.data.write().await.insert(key.into(), value);
    }

    pub async fn forget(&self, key: &str) {
        self.data.write().await.remove(key);
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

pub(crate) async fn session_get(session: Option<&SessionHandle>, key: &str) -> AuthResult<Option<Value>> {
    match session {
        Some(session) => Ok(session.get(key).await),
        None => Ok(None),
    }
}

pub(crate) fn require_session(session: Option<&SessionHandle>) -> AuthResult<&SessionHandle> {
    session.ok_or_else(|| AuthError::config("no session is attached to this request"))
}

/// In-memory request, for the CLI and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    headers: HashMap<String, String>,
    input: HashMap<String, String>,
    session: Option<SessionHandle>,
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("authorization", format!("Bearer {}", token))
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.input.insert(name.into(), value.into());
        self
    }

    pub fn with_session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }
}

#[async_trait]
impl RequestContext for MemoryContext {
    fn header(&self, name: &str) -> Option<String> {
        self.headers.get(&name.to_ascii_lowercase()).cloned()
    }

    fn input(&self, name: &str) -> Option<String> {
        self.input.get(name).cloned()
    }

    async fn session_get(&self, key: &str) -> AuthResult<Option<Value>> {
        session_get(self.session.as_ref(), key).await
    }

    async fn session_put(&self, key: &str, value: Value) -> AuthResult<()> {
        require_session(self.session.as_ref())?.put(key, value).await;
        Ok(())
    }

    async fn session_forget(&self, key: &str) -> AuthResult<()> {
        require_session(self.session.as_ref())?.forget(key).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bearer_from_header_wins() {
        let ctx = MemoryContext::new().with_bearer("abc").with_input("token", "from-input");
        assert_eq!(bearer_token(&ctx), Some("abc".to_string()));
    }

    #[test]
    fn test_bearer_falls_back_to_input() {
        let ctx = MemoryContext::new()
            .with_header("Authorization", "Basic Zm9vOmJhcg==")
            .with_input("token", "from-input");
        assert_eq!(bearer_token(&ctx), Some("from-input".to_string()));
    }

    #[test]
    fn test_bearer_absent() {
        assert_eq!(bearer_token(&MemoryContext::new()), None);
        assert_eq!(bearer_token(&MemoryContext::new().with_header("authorization", "Bearer ")), None);
        assert_eq!(bearer_token(&MemoryContext::new().with_input("token", "")), None);
    }

    #[test]
    fn test_bearer_scheme_is_case_insensitive() {
        let ctx = MemoryContext::new().with_header("AUTHORIZATION", "bearer xyz");
        assert_eq!(bearer_token(&ctx), Some("xyz".to_string()));
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let session = SessionHandle::new();
        let ctx = MemoryContext::new().with_session(session.clone());

        ctx.session_put("auth_web", json!("u-1")).await.unwrap();
        assert_eq!(ctx.session_get("auth_web").await.unwrap(), Some(json!("u-1")));
        assert_eq!(session.get("auth_web").await, Some(json!("u-1")));

        ctx.session_forget("auth_web").await.unwrap();
        assert_eq!(ctx.session_get("auth_web").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let ctx = MemoryContext::new();
        assert_eq!(ctx.session_get("k").await.unwrap(), None);
        assert!(matches!(
            ctx.session_put("k", json!(1)).await,
            Err(AuthError::Configuration(_))
        ));
    }
}
