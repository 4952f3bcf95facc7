//! Demo HTTP server: login, current user and logout over the configured schemes.
//!
//! Sessions are kept in process memory behind an `authkit_session` cookie,
//! enough to exercise the session scheme end to end. Idle sessions expire
//! and a login always moves the session to a fresh id.

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{FromRef, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header::COOKIE, header::SET_COOKIE},
    middleware::{Next, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::auth::Auth;
use crate::config::SchemeKind;
use crate::context::SessionHandle;
use crate::error::AuthError;
use crate::http::{CurrentUser, RequireAuth, require_auth};
use crate::manager::AuthManager;
use crate::provider::{AuthUser, Constraints};
use crate::scheme::{ApiScheme, SessionScheme};
use crate::token::TokenOptions;
use crate::types::SchemeName;

pub const SESSION_COOKIE: &str = "authkit_session";

/// Idle time after which a session is dropped.
pub const DEFAULT_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

#[derive(Debug, Clone)]
struct SessionEntry {
    handle: SessionHandle,
    last_seen: Instant,
}

/// In-memory session store keyed by cookie value.
#[derive(Debug, Clone)]
pub struct MemorySessions {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    idle_timeout: Duration,
}

impl Default for MemorySessions {
    fn default() -> Self {
        Self::with_idle_timeout(DEFAULT_SESSION_IDLE_TIMEOUT)
    }
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            idle_timeout,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// The live session for `id`, refreshing its idle timer. Expired
    /// sessions are removed and read as unknown.
    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        if sessions.get(id)?.last_seen.elapsed() >= self.idle_timeout {
            sessions.remove(id);
            debug!("Session expired after {:?} idle", self.idle_timeout);
            return None;
        }

        let entry = sessions.get_mut(id)?;
        entry.last_seen = Instant::now();
        Some(entry.handle.clone())
    }

    /// Store `handle` under a new id and return the id.
    pub async fn insert(&self, handle: SessionHandle) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut sessions = self.sessions.write().await;

        let idle_timeout = self.idle_timeout;
        sessions.retain(|_, entry| entry.last_seen.elapsed() < idle_timeout);
        sessions.insert(
            id.clone(),
            SessionEntry {
                handle,
                last_seen: Instant::now(),
            },
        );
        id
    }

    pub async fn remove(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }
}

/// Response marker: the session behind this request must move to a new id.
#[derive(Debug, Clone, Copy)]
struct RotateSession;

#[derive(Clone)]
pub struct AppState {
    manager: Arc<AuthManager>,
}

impl FromRef<AppState> for Arc<AuthManager> {
    fn from_ref(state: &AppState) -> Self {
        state.manager.clone()
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    /// Scheme to log in with; the default scheme when absent.
    scheme: Option<String>,
    uid: String,
    password: String,
    /// Token label for token schemes.
    name: Option<String>,
    #[serde(default)]
    constraints: Constraints,
}

pub fn create_router(manager: Arc<AuthManager>) -> Router {
    create_router_with_sessions(manager, MemorySessions::new())
}

pub fn create_router_with_sessions(manager: Arc<AuthManager>, sessions: MemorySessions) -> Router {
    let guard = RequireAuth::new(manager.clone()).schemes(guard_order(&manager));
    let state = AppState { manager };

    let protected = Router::new()
        .route("/me", get(current_user))
        .route_layer(from_fn_with_state(guard, require_auth));

    Router::new()
        .route("/health", get(health_check))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(from_fn_with_state(sessions, session_layer)),
        )
        .with_state(state)
}

pub async fn run_server(manager: Arc<AuthManager>, bind: &str) -> Result<()> {
    let router = create_router(manager);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Auth server listening on http://{}", bind);

    axum::serve(listener, router).await?;
    Ok(())
}

/// The configured fallback order, then the default scheme.
fn guard_order(manager: &AuthManager) -> Vec<SchemeName> {
    let mut names = manager.fallback_order(&[]);
    if !names.contains(manager.default_scheme()) {
        names.push(manager.default_scheme().clone());
    }
    names
}

/// The user without any configured password column.
fn public_user(manager: &AuthManager, user: &AuthUser) -> AuthUser {
    let hidden: Vec<String> = manager
        .scheme_names()
        .iter()
        .filter_map(|name| manager.config(name.as_str()).ok())
        .map(|config| config.password_field.clone())
        .collect();
    let hidden: Vec<&str> = hidden.iter().map(String::as_str).collect();
    user.without(&hidden)
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn login(
    State(state): State<AppState>,
    mut auth: Auth,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    let scheme = auth.use_scheme(payload.scheme.as_deref())?;
    let name = scheme.name().clone();
    let kind = scheme.kind();

    if let Some(issuer) = scheme.as_token_issuer() {
        let options = payload.name.map(TokenOptions::named).unwrap_or_default();
        let issued = issuer
            .attempt(&payload.uid, &payload.password, &payload.constraints, options)
            .await?;
        info!("Issued {} token via scheme {}", kind, name);
        return Ok(Json(json!({ "scheme": name, "token": issued })).into_response());
    }

    let user = match kind {
        SchemeKind::Session => {
            auth.use_as::<SessionScheme>(name.as_str())?
                .attempt(&payload.uid, &payload.password, &payload.constraints)
                .await?
        }
        _ => {
            auth.use_scheme(Some(name.as_str()))?
                .validate(&payload.uid, &payload.password, &payload.constraints)
                .await?
        }
    };

    let mut response = Json(json!({
        "scheme": name,
        "user": public_user(&state.manager, &user),
    }))
    .into_response();
    if kind == SchemeKind::Session {
        response.extensions_mut().insert(RotateSession);
    }
    Ok(response)
}

async fn current_user(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Json<Value> {
    Json(json!({ "user": public_user(&state.manager, &user) }))
}

/// End the credential that authenticated the request: revoke an API token,
/// or clear the session. JWT and Basic credentials are stateless.
async fn logout(State(state): State<AppState>, mut auth: Auth) -> Result<Json<Value>, AuthError> {
    auth.authenticate_any(&guard_order(&state.manager)).await?;
    let name = auth.active_name().clone();

    let revoked = match state.manager.config(name.as_str())?.kind {
        SchemeKind::Api => {
            auth.use_as::<ApiScheme>(name.as_str())?.revoke().await?;
            true
        }
        SchemeKind::Session => {
            auth.use_as::<SessionScheme>(name.as_str())?.logout().await?;
            true
        }
        SchemeKind::Jwt | SchemeKind::Basic => false,
    };

    Ok(Json(json!({ "status": "ok", "scheme": name, "revoked": revoked })))
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// Attach the client's session to the request. New sessions are stored
/// once they hold data, known ones are dropped once empty, and a login
/// moves the session to a fresh id.
async fn session_layer(
    State(sessions): State<MemorySessions>,
    mut request: Request,
    next: Next,
) -> Response {
    let known = match session_cookie(request.headers()) {
        Some(id) => sessions.get(&id).await.map(|handle| (id, handle)),
        None => None,
    };
    let (known_id, handle) = match known {
        Some((id, handle)) => (Some(id), handle),
        None => (None, SessionHandle::new()),
    };

    request.extensions_mut().insert(handle.clone());
    let mut response = next.run(request).await;

    let rotate = response.extensions().get::<RotateSession>().is_some();
    let empty = handle.is_empty().await;
    let issue = match known_id {
        Some(id) if empty => {
            sessions.remove(&id).await;
            false
        }
        Some(id) if rotate => {
            sessions.remove(&id).await;
            true
        }
        Some(_) => false,
        None => !empty,
    };

    if issue {
        let id = sessions.insert(handle).await;
        let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", SESSION_COOKIE, id);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{seed_user, test_manager};
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use tower::ServiceExt;

    async fn app() -> (Router, MemorySessions) {
        let manager = test_manager().await;
        seed_user(manager.db(), "users", json!({"uid": "u-1", "email": "foo@x.com"}), Some("secret")).await;
        let sessions = MemorySessions::new();
        (create_router_with_sessions(manager, sessions.clone()), sessions)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_with(uri: &str, header: (&str, &str)) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header.0, header.1)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_api_token_login_me_logout() {
        let (app, _) = app().await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/login",
                json!({"scheme": "api", "uid": "foo@x.com", "password": "secret", "name": "cli"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["token"]["type"], "bearer");
        let bearer = format!("Bearer {}", body["token"]["token"].as_str().unwrap());

        let response = app
            .clone()
            .oneshot(get_with("/me", ("Authorization", &bearer)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["user"]["id"], "u-1");
        assert!(body["user"].get("password").is_none());

        let mut logout = post_json("/logout", json!({}));
        logout
            .headers_mut()
            .insert("Authorization", HeaderValue::from_str(&bearer).unwrap());
        let response = app.clone().oneshot(logout).await.unwrap();
        assert_eq!(body_json(response).await["revoked"], true);

        let response = app
            .oneshot(get_with("/me", ("Authorization", &bearer)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_session_login_via_cookie() {
        let (app, sessions) = app().await;

        let response = app
            .clone()
            .oneshot(post_json("/login", json!({"uid": "foo@x.com", "password": "secret"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = cookie_from(&response);
        assert_eq!(body_json(response).await["scheme"], "web");
        assert_eq!(sessions.len().await, 1);

        let response = app
            .clone()
            .oneshot(get_with("/me", ("Cookie", &cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["user"]["email"], "foo@x.com");

        let response = app
            .clone()
            .oneshot(post_with_cookie("/logout", json!({}), &cookie))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["scheme"], "web");
        assert_eq!(sessions.len().await, 0);

        let response = app
            .oneshot(get_with("/me", ("Cookie", &cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    fn cookie_from(response: &Response) -> String {
        response.headers()[SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string()
    }

    fn post_with_cookie(uri: &str, body: Value, cookie: &str) -> Request<Body> {
        let mut request = post_json(uri, body);
        request
            .headers_mut()
            .insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        request
    }

    #[tokio::test]
    async fn test_login_rotates_session_id() {
        let (app, sessions) = app().await;
        let credentials = json!({"uid": "foo@x.com", "password": "secret"});

        let response = app
            .clone()
            .oneshot(post_json("/login", credentials.clone()))
            .await
            .unwrap();
        let first = cookie_from(&response);

        let response = app
            .clone()
            .oneshot(post_with_cookie("/login", credentials, &first))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let second = cookie_from(&response);
        assert_ne!(first, second);
        assert_eq!(sessions.len().await, 1);

        let response = app
            .clone()
            .oneshot(get_with("/me", ("Cookie", &first)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(get_with("/me", ("Cookie", &second)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let manager = test_manager().await;
        seed_user(manager.db(), "users", json!({"uid": "u-1", "email": "foo@x.com"}), Some("secret")).await;
        let sessions = MemorySessions::with_idle_timeout(Duration::ZERO);
        let app = create_router_with_sessions(manager, sessions.clone());

        let response = app
            .clone()
            .oneshot(post_json("/login", json!({"uid": "foo@x.com", "password": "secret"})))
            .await
            .unwrap();
        let cookie = cookie_from(&response);
        assert_eq!(sessions.len().await, 1);

        let response = app
            .oneshot(get_with("/me", ("Cookie", &cookie)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(sessions.len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_login_is_401_without_session() {
        let (app, sessions) = app().await;

        let response = app
            .oneshot(post_json("/login", json!({"uid": "foo@x.com", "password": "nope"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(SET_COOKIE).is_none());
        assert_eq!(body_json(response).await["error"], "Password mismatch");
        assert_eq!(sessions.len().await, 0);
    }

    #[tokio::test]
    async fn test_jwt_login() {
        let (app, _) = app().await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/login",
                json!({"scheme": "jwt", "uid": "foo@x.com", "password": "secret"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["token"]["expires_at"].is_string());
        let bearer = format!("Bearer {}", body["token"]["token"].as_str().unwrap());

        let response = app
            .oneshot(get_with("/me", ("Authorization", &bearer)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_session_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark; authkit_session=abc123"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc123"));

        headers.insert(COOKIE, HeaderValue::from_static("theme=dark"));
        assert_eq!(session_cookie(&headers), None);
    }
}
