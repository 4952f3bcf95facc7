//! Multi-scheme fallback.
//!
//! Schemes are tried in order and each at most once per request: a scheme
//! that already failed on this façade is not run again, its recorded error
//! stands in. The first scheme that authenticates becomes the façade's
//! active scheme. When every scheme fails, the error of the last one tried
//! is returned; earlier failures are only logged.

use tracing::{debug, instrument, trace};

use crate::auth::Auth;
use crate::error::{AuthError, AuthResult};
use crate::provider::AuthUser;
use crate::types::SchemeName;

/// Authenticate with the first scheme in `names` that accepts the request.
///
/// Per-scheme failures move on to the next scheme. Configuration and store
/// failures stop the loop and are returned as-is.
#[instrument(skip(auth, names), fields(schemes = ?names))]
pub async fn authenticate_in_order(auth: &mut Auth, names: &[SchemeName]) -> AuthResult<AuthUser> {
    let mut last_error = AuthError::MissingCredential;

    for name in names {
        let scheme = auth.use_scheme(Some(name.as_str()))?;

        // A login since the failure (e.g. session attempt) wins
        let cached = scheme.user().cloned();
        let outcome = match cached {
            Some(user) => Ok(user),
            None => match auth.failure(name) {
                Some(previous) => {
                    trace!("Scheme {} already failed in this request", name);
                    Err(previous.clone())
                }
                None => auth.use_scheme(Some(name.as_str()))?.authenticate().await,
            },
        };

        match outcome {
            Ok(user) => {
                auth.forget_failure(name);
                auth.set_active(name)?;
                debug!("Authenticated user {} via scheme {}", user.id, name);
                return Ok(user);
            }
            Err(e) if e.is_recoverable() => {
                trace!("Scheme {} failed: {}", name, e);
                auth.record_failure(name, e.clone());
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MemoryContext, RequestContext};
    use async_trait::async_trait;
    use crate::test_utils::{seed_user, test_manager};
    use crate::token::TokenOptions;
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn names(list: &[&str]) -> Vec<SchemeName> {
        list.iter().map(|name| SchemeName::new(*name)).collect()
    }

    /// Counts header reads, i.e. how often a scheme went looking for credentials.
    struct CountingContext {
        inner: MemoryContext,
        header_reads: AtomicUsize,
    }

    #[async_trait]
    impl RequestContext for CountingContext {
        fn header(&self, name: &str) -> Option<String> {
            self.header_reads.fetch_add(1, Ordering::SeqCst);
            self.inner.header(name)
        }

        fn input(&self, name: &str) -> Option<String> {
            self.inner.input(name)
        }

        async fn session_get(&self, key: &str) -> AuthResult<Option<Value>> {
            self.inner.session_get(key).await
        }

        async fn session_put(&self, key: &str, value: Value) -> AuthResult<()> {
            self.inner.session_put(key, value).await
        }

        async fn session_forget(&self, key: &str) -> AuthResult<()> {
            self.inner.session_forget(key).await
        }
    }

    #[tokio::test]
    async fn test_first_failure_then_success_switches_active() {
        let manager = test_manager().await;
        seed_user(manager.db(), "users", json!({"uid": "u-1", "email": "foo@x.com"}), Some("secret")).await;
        let header = format!("Basic {}", STANDARD.encode("foo@x.com:secret"));

        let mut auth = manager.auth(Arc::new(MemoryContext::new().with_header("Authorization", header)));
        assert_eq!(auth.active_name().as_str(), "web");

        let user = auth.authenticate_any(&names(&["jwt", "basic"])).await.unwrap();
        assert_eq!(user.id.as_str(), "u-1");
        assert_eq!(auth.active_name().as_str(), "basic");
        assert_eq!(auth.current_user().unwrap().id.as_str(), "u-1");
        assert!(auth.check().await.unwrap());
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let manager = test_manager().await;
        seed_user(manager.db(), "users", json!({"uid": "u-1", "email": "foo@x.com"}), Some("secret")).await;
        let header = format!("Basic {}", STANDARD.encode("foo@x.com:wrong"));
        let ctx = Arc::new(MemoryContext::new().with_header("Authorization", header));

        // jwt: no bearer token; basic: wrong password
        let mut auth = manager.auth(ctx.clone());
        let err = auth.authenticate_any(&names(&["jwt", "basic"])).await.unwrap_err();
        assert_eq!(err, AuthError::PasswordMismatch);
        assert_eq!(auth.active_name().as_str(), "web");

        let mut auth = manager.auth(ctx);
        let err = auth.authenticate_any(&names(&["basic", "jwt"])).await.unwrap_err();
        assert_eq!(err, AuthError::MissingCredential);
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let manager = test_manager().await;
        seed_user(manager.db(), "users", json!({"uid": "u-1", "email": "foo@x.com"}), Some("secret")).await;

        let mut issuer_auth = manager.auth(Arc::new(MemoryContext::new()));
        let user = issuer_auth
            .use_scheme(Some("api"))
            .unwrap()
            .validate("foo@x.com", "secret", &Default::default())
            .await
            .unwrap();
        let token = issuer_auth
            .use_scheme(Some("api"))
            .unwrap()
            .as_token_issuer()
            .unwrap()
            .generate(&user, TokenOptions::default())
            .await
            .unwrap()
            .token;

        let mut auth = manager.auth(Arc::new(MemoryContext::new().with_bearer(&token)));
        auth.authenticate_any(&names(&["api", "jwt"])).await.unwrap();
        assert_eq!(auth.active_name().as_str(), "api");

        // jwt was never consulted
        assert!(auth.use_scheme(Some("jwt")).unwrap().user().is_none());
    }

    #[tokio::test]
    async fn test_default_order_from_configuration() {
        let manager = test_manager().await;
        let mut auth = manager.auth(Arc::new(MemoryContext::new()));

        // Configured fallback is ["jwt", "api"]; neither has a credential
        let err = auth.authenticate_any(&[]).await.unwrap_err();
        assert_eq!(err, AuthError::MissingCredential);
    }

    #[tokio::test]
    async fn test_unknown_scheme_aborts() {
        let manager = test_manager().await;
        let mut auth = manager.auth(Arc::new(MemoryContext::new()));

        let err = auth.authenticate_any(&names(&["jwt", "nope", "api"])).await.unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_check_on_scheme_reflects_fallback_result() {
        let manager = test_manager().await;
        let mut auth = manager.auth(Arc::new(MemoryContext::new().with_bearer("garbage")));

        let err = auth.authenticate_any(&names(&["jwt", "api"])).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
        assert!(!auth.use_scheme(Some("api")).unwrap().check().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_scheme_runs_once_per_request() {
        let manager = test_manager().await;
        seed_user(manager.db(), "users", json!({"uid": "u-1", "email": "foo@x.com"}), Some("secret")).await;
        let header = format!("Basic {}", STANDARD.encode("foo@x.com:wrong"));
        let ctx = Arc::new(CountingContext {
            inner: MemoryContext::new().with_header("Authorization", header),
            header_reads: AtomicUsize::new(0),
        });

        let mut auth = manager.auth(ctx.clone());
        let err = auth.authenticate_any(&names(&["basic", "basic"])).await.unwrap_err();
        assert_eq!(err, AuthError::PasswordMismatch);
        let reads = ctx.header_reads.load(Ordering::SeqCst);
        assert_eq!(reads, 1);

        // A second pass replays the recorded failure
        let err = auth.authenticate_any(&names(&["basic"])).await.unwrap_err();
        assert_eq!(err, AuthError::PasswordMismatch);
        assert_eq!(ctx.header_reads.load(Ordering::SeqCst), reads);
        assert_eq!(auth.failure(&SchemeName::new("basic")), Some(&AuthError::PasswordMismatch));
    }

    #[tokio::test]
    async fn test_login_after_failure_is_honoured() {
        let manager = test_manager().await;
        seed_user(manager.db(), "users", json!({"uid": "u-1", "email": "foo@x.com"}), Some("secret")).await;
        let session = crate::context::SessionHandle::new();
        let mut auth = manager.auth(Arc::new(MemoryContext::new().with_session(session)));

        let err = auth.authenticate_any(&names(&["web"])).await.unwrap_err();
        assert_eq!(err, AuthError::MissingCredential);

        auth.use_as::<crate::scheme::SessionScheme>("web")
            .unwrap()
            .attempt("foo@x.com", "secret", &Default::default())
            .await
            .unwrap();

        let user = auth.authenticate_any(&names(&["web"])).await.unwrap();
        assert_eq!(user.id.as_str(), "u-1");
        assert!(auth.failure(&SchemeName::new("web")).is_none());
    }
}
