//! Per-request authentication façade.
//!
//! An `Auth` is created for one request and owns the scheme instances that
//! request touches. Schemes are built on first use and cached by name, so
//! repeated access within the request reuses the same instance (and its
//! cached user). Nothing here is shared across requests.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::{AuthError, AuthResult};
use crate::fallback;
use crate::manager::AuthManager;
use crate::provider::AuthUser;
use crate::scheme::Scheme;
use crate::types::SchemeName;

pub struct Auth {
    manager: Arc<AuthManager>,
    ctx: Arc<dyn RequestContext>,
    schemes: HashMap<SchemeName, Box<dyn Scheme>>,
    /// Per-scheme failures seen by fallback in this request.
    failures: HashMap<SchemeName, AuthError>,
    active: SchemeName,
}

impl Auth {
    pub fn new(manager: Arc<AuthManager>, ctx: Arc<dyn RequestContext>) -> Self {
        let active = manager.default_scheme().clone();
        Self {
            manager,
            ctx,
            schemes: HashMap::new(),
            failures: HashMap::new(),
            active,
        }
    }

    pub fn manager(&self) -> &Arc<AuthManager> {
        &self.manager
    }

    pub fn context(&self) -> &Arc<dyn RequestContext> {
        &self.ctx
    }

    /// The scheme instance for `name` (the default scheme when `None`),
    /// built on first access.
    pub fn use_scheme(&mut self, name: Option<&str>) -> AuthResult<&mut dyn Scheme> {
        let name = match name {
            Some(name) => SchemeName::new(name),
            None => self.manager.default_scheme().clone(),
        };

        if !self.schemes.contains_key(&name) {
            let scheme = self.manager.instantiate(name.as_str(), self.ctx.clone())?;
            self.schemes.insert(name.clone(), scheme);
        }

        match self.schemes.get_mut(&name) {
            Some(scheme) => Ok(&mut **scheme),
            None => Err(AuthError::config(format!("scheme `{}` is not configured", name))),
        }
    }

    /// Typed access to a scheme, e.g. `auth.use_as::<JwtScheme>("jwt")`.
    pub fn use_as<S: Scheme>(&mut self, name: &str) -> AuthResult<&mut S> {
        let scheme = self.use_scheme(Some(name))?;
        let kind = scheme.kind();
        scheme.as_any_mut().downcast_mut::<S>().ok_or_else(|| {
            AuthError::config(format!(
                "scheme `{}` is a {} scheme, not {}",
                name,
                kind,
                std::any::type_name::<S>()
            ))
        })
    }

    /// The currently active scheme.
    pub fn active(&mut self) -> AuthResult<&mut dyn Scheme> {
        let name = self.active.clone();
        self.use_scheme(Some(name.as_str()))
    }

    pub fn active_name(&self) -> &SchemeName {
        &self.active
    }

    /// Make `name` the active scheme.
    pub fn set_active(&mut self, name: &SchemeName) -> AuthResult<()> {
        if !self.manager.contains(name.as_str()) {
            return Err(AuthError::config(format!("scheme `{}` is not configured", name)));
        }
        self.active = name.clone();
        Ok(())
    }

    /// `check()` on the active scheme.
    pub async fn check(&mut self) -> AuthResult<bool> {
        self.active()?.check().await
    }

    /// `get_user()` on the active scheme.
    pub async fn get_user(&mut self) -> AuthResult<Option<AuthUser>> {
        self.active()?.get_user().await
    }

    /// User cached on the active scheme, without triggering authentication.
    pub fn current_user(&self) -> Option<&AuthUser> {
        self.schemes.get(&self.active).and_then(|scheme| scheme.user())
    }

    /// The failure fallback recorded for `name` in this request, if any.
    pub fn failure(&self, name: &SchemeName) -> Option<&AuthError> {
        self.failures.get(name)
    }

    pub(crate) fn record_failure(&mut self, name: &SchemeName, error: AuthError) {
        self.failures.insert(name.clone(), error);
    }

    pub(crate) fn forget_failure(&mut self, name: &SchemeName) {
        self.failures.remove(name);
    }

    /// Try `names` in order (the configured fallback order when empty) and
    /// make the first scheme that authenticates active.
    pub async fn authenticate_any(&mut self, names: &[SchemeName]) -> AuthResult<AuthUser> {
        let names = self.manager.fallback_order(names);
        fallback::authenticate_in_order(self, &names).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MemoryContext, SessionHandle};
    use crate::scheme::{ApiScheme, BasicScheme, JwtScheme, SessionScheme};
    use crate::test_utils::{seed_user, test_manager};
    use crate::token::TokenOptions;
    use crate::config::SchemeKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_schemes_are_memoized_per_request() {
        let manager = test_manager().await;
        seed_user(manager.db(), "users", json!({"uid": "u-1", "email": "foo@x.com"}), Some("secret")).await;

        let session = SessionHandle::new();
        let mut auth = manager.auth(Arc::new(MemoryContext::new().with_session(session)));

        auth.use_as::<SessionScheme>("web")
            .unwrap()
            .attempt("foo@x.com", "secret", &Default::default())
            .await
            .unwrap();

        // Same instance: the user cached by attempt() is still there
        let scheme = auth.use_scheme(Some("web")).unwrap();
        assert_eq!(scheme.user().unwrap().id.as_str(), "u-1");
        assert_eq!(auth.current_user().unwrap().id.as_str(), "u-1");
    }

    #[tokio::test]
    async fn test_default_scheme() {
        let manager = test_manager().await;
        let mut auth = manager.auth(Arc::new(MemoryContext::new()));

        assert_eq!(auth.active_name().as_str(), "web");
        assert_eq!(auth.use_scheme(None).unwrap().kind(), SchemeKind::Session);
        assert!(!auth.check().await.unwrap());
        assert!(auth.current_user().is_none());
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_a_configuration_error() {
        let manager = test_manager().await;
        let mut auth = manager.auth(Arc::new(MemoryContext::new()));

        assert!(matches!(auth.use_scheme(Some("nope")), Err(AuthError::Configuration(_))));
        assert!(matches!(
            auth.set_active(&SchemeName::new("nope")),
            Err(AuthError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_use_as_kind_mismatch() {
        let manager = test_manager().await;
        let mut auth = manager.auth(Arc::new(MemoryContext::new()));

        assert!(auth.use_as::<JwtScheme>("jwt").is_ok());
        assert!(auth.use_as::<BasicScheme>("basic").is_ok());
        let err = auth.use_as::<ApiScheme>("jwt").err().unwrap();
        assert!(matches!(err, AuthError::Configuration(ref msg) if msg.contains("jwt scheme")));
    }

    #[tokio::test]
    async fn test_token_issuer_access() {
        let manager = test_manager().await;
        seed_user(manager.db(), "users", json!({"uid": "u-1", "email": "foo@x.com"}), Some("secret")).await;
        let mut auth = manager.auth(Arc::new(MemoryContext::new()));

        assert!(auth.use_scheme(Some("web")).unwrap().as_token_issuer().is_none());

        let issuer = auth.use_scheme(Some("api")).unwrap().as_token_issuer().unwrap();
        let issued = issuer
            .attempt("foo@x.com", "secret", &Default::default(), TokenOptions::default())
            .await
            .unwrap();

        let mut next = manager.auth(Arc::new(MemoryContext::new().with_bearer(&issued.token)));
        next.set_active(&SchemeName::new("api")).unwrap();
        assert!(next.check().await.unwrap());
        assert_eq!(next.get_user().await.unwrap().unwrap().id.as_str(), "u-1");
    }
}
