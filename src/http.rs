//! axum adapter.
//!
//! - [`HttpRequestContext`] exposes a request's headers, query string and
//!   session to the schemes
//! - [`require_auth`] runs the fallback algorithm in front of a router and
//!   stores the user as a [`CurrentUser`] extension
//! - [`Auth`] and [`CurrentUser`] are extractors for handlers; behind
//!   [`require_auth`], `Auth` is the façade that authenticated the request
//!
//! Session storage belongs to the host: a layer that inserts a
//! [`SessionHandle`] into the request extensions makes the session scheme
//! available.

use async_trait::async_trait;
use axum::{
    Json,
    extract::{FromRef, FromRequestParts, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::WWW_AUTHENTICATE, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, instrument};

use crate::auth::Auth;
use crate::context::{RequestContext, SessionHandle, require_session, session_get};
use crate::error::{AuthError, AuthResult};
use crate::manager::AuthManager;
use crate::provider::AuthUser;
use crate::types::SchemeName;

/// [`RequestContext`] over an axum request.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestContext {
    headers: HeaderMap,
    input: HashMap<String, String>,
    session: Option<SessionHandle>,
}

impl HttpRequestContext {
    /// Capture headers, query parameters and the session handle (if any).
    pub fn from_parts(parts: &Parts) -> Self {
        let input = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(query)| query)
            .unwrap_or_default();

        Self {
            headers: parts.headers.clone(),
            input,
            session: parts.extensions.get::<SessionHandle>().cloned(),
        }
    }

    /// Add a body field; it takes precedence over a query parameter of the
    /// same name.
    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.input.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl RequestContext for HttpRequestContext {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
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

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Store and configuration details stay in the logs
        let message = if self.is_recoverable() {
            self.to_string()
        } else {
            error!("Authentication failed: {}", self);
            "Internal server error".to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// The user [`require_auth`] authenticated.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub AuthUser);

impl Deref for CurrentUser {
    type Target = AuthUser;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingCredential)
    }
}

/// Façade left behind by [`require_auth`] for the handler to pick up.
#[derive(Clone)]
struct AuthSlot(Arc<Mutex<Option<Auth>>>);

/// The façade [`require_auth`] authenticated, with the successful scheme
/// active and its user cached. Without the middleware (or when extracted a
/// second time) a fresh, unauthenticated façade.
impl<S> FromRequestParts<S> for Auth
where
    Arc<AuthManager>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(AuthSlot(slot)) = parts.extensions.get::<AuthSlot>().cloned() {
            if let Some(auth) = slot.lock().await.take() {
                return Ok(auth);
            }
        }

        let manager = Arc::<AuthManager>::from_ref(state);
        Ok(manager.auth(Arc::new(HttpRequestContext::from_parts(parts))))
    }
}

/// State for [`require_auth`]: which schemes guard the routes.
#[derive(Debug, Clone)]
pub struct RequireAuth {
    manager: Arc<AuthManager>,
    schemes: Vec<SchemeName>,
}

impl RequireAuth {
    /// Guard with the configured fallback order.
    pub fn new(manager: Arc<AuthManager>) -> Self {
        Self {
            manager,
            schemes: Vec::new(),
        }
    }

    /// Guard with an explicit scheme list, tried in order.
    pub fn schemes<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<SchemeName>,
    {
        self.schemes = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Middleware authenticating every request before it reaches the router.
///
/// Use with `axum::middleware::from_fn_with_state(RequireAuth::new(..), require_auth)`.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn require_auth(
    State(guard): State<RequireAuth>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let names = guard.manager.fallback_order(&guard.schemes);
    let mut auth = guard
        .manager
        .auth(Arc::new(HttpRequestContext::from_parts(&parts)));

    match auth.authenticate_any(&names).await {
        Ok(user) => {
            parts.extensions.insert(CurrentUser(user));
            parts.extensions.insert(AuthSlot(Arc::new(Mutex::new(Some(auth)))));
            next.run(Request::from_parts(parts, body)).await
        }
        Err(e) => {
            let challenge = e
                .is_recoverable()
                .then(|| guard.manager.challenge_for(&names))
                .flatten();

            let mut response = e.into_response();
            if let Some(value) = challenge.and_then(|c| HeaderValue::from_str(&c).ok()) {
                response.headers_mut().insert(WWW_AUTHENTICATE, value);
            }
            response
        }
    }
}
