//! Authentication schemes.
//!
//! A scheme is one way of proving identity (session, Basic, JWT, API token).
//! Instances live for a single request: they read credentials from the
//! request's [`RequestContext`], resolve the user through their
//! [`UserProvider`] and cache the result, so a second `check()` on the same
//! instance never touches the store again.

mod api;
mod basic;
mod jwt;
mod session;

pub use api::{ApiScheme, DEFAULT_TOKEN_NAME};
pub use basic::{BasicScheme, basic_challenge};
pub use jwt::{JwtClaims, JwtScheme};
pub use session::SessionScheme;

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tracing::trace;

use crate::config::{ResolvedScheme, SchemeKind};
use crate::context::RequestContext;
use crate::error::{AuthError, AuthResult};
use crate::provider::{AuthUser, Constraints, UserProvider};
use crate::token::{IssuedToken, TokenOptions};
use crate::types::SchemeName;

/// One authentication mechanism, bound to one request.
#[async_trait]
pub trait Scheme: Send + Sync + 'static {
    fn name(&self) -> &SchemeName;

    fn kind(&self) -> SchemeKind;

    /// The cached user, if this instance already authenticated.
    fn user(&self) -> Option<&AuthUser>;

    /// Authenticate the request, caching the user on success.
    ///
    /// Returns the cached user without any lookup when one is set. Failures
    /// carry the reason; see [`Scheme::check`] for the boolean form.
    async fn authenticate(&mut self) -> AuthResult<AuthUser>;

    /// Look a user up by `uid` and `constraints` and verify `password`.
    ///
    /// Fails with `UserNotFound` or `PasswordMismatch`. Does not touch the
    /// cached user.
    async fn validate(
        &self,
        uid: &str,
        password: &str,
        constraints: &Constraints,
    ) -> AuthResult<AuthUser>;

    /// Whether the request is authenticated by this scheme.
    ///
    /// Authentication failures are `Ok(false)`; configuration and store
    /// failures are errors.
    async fn check(&mut self) -> AuthResult<bool> {
        match self.authenticate().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_recoverable() => {
                trace!("Scheme {} did not authenticate: {}", self.name(), e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// The authenticated user, or `None`.
    async fn get_user(&mut self) -> AuthResult<Option<AuthUser>> {
        if self.check().await? {
            Ok(self.user().cloned())
        } else {
            Ok(None)
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Token operations, for schemes that issue tokens.
    fn as_token_issuer(&mut self) -> Option<&mut dyn TokenIssuer> {
        None
    }
}

/// Schemes that hand out bearer tokens.
#[async_trait]
pub trait TokenIssuer: Scheme {
    /// Issue a token for `user`. The plaintext exists only in the result.
    async fn generate(&self, user: &AuthUser, options: TokenOptions) -> AuthResult<IssuedToken>;

    /// Validate credentials, then issue a token for the user.
    async fn attempt(
        &self,
        uid: &str,
        password: &str,
        constraints: &Constraints,
        options: TokenOptions,
    ) -> AuthResult<IssuedToken> {
        let user = self.validate(uid, password, constraints).await?;
        self.generate(&user, options).await
    }
}

/// What every scheme instance is built from.
#[derive(Clone)]
pub struct SchemeParts {
    pub config: Arc<ResolvedScheme>,
    pub provider: Arc<dyn UserProvider>,
    pub ctx: Arc<dyn RequestContext>,
}

/// Shared credential check behind every scheme's `validate`.
pub(crate) async fn validate_credentials(
    provider: &dyn UserProvider,
    uid: &str,
    password: &str,
    constraints: &Constraints,
) -> AuthResult<AuthUser> {
    let user = provider
        .find_by_credentials(uid, constraints)
        .await?
        .ok_or(AuthError::UserNotFound)?;

    if !provider.validate_credentials(&user, password).await? {
        return Err(AuthError::PasswordMismatch);
    }

    Ok(user)
}

/// Build the scheme `config.kind` describes.
pub fn build_scheme(parts: SchemeParts) -> AuthResult<Box<dyn Scheme>> {
    Ok(match parts.config.kind {
        SchemeKind::Session => Box::new(SessionScheme::new(parts)),
        SchemeKind::Basic => Box::new(BasicScheme::new(parts)),
        SchemeKind::Jwt => Box::new(JwtScheme::new(parts)?),
        SchemeKind::Api => Box::new(ApiScheme::new(parts)?),
    })
}
