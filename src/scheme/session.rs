use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use tracing::{debug, instrument, warn};

use super::{Scheme, SchemeParts, validate_credentials};
use crate::config::SchemeKind;
use crate::error::{AuthError, AuthResult};
use crate::provider::{AuthUser, Constraints};
use crate::types::{SchemeName, UserIdentifier};

/// Session-backed scheme: the user identifier lives in the session under
/// the scheme's session key.
pub struct SessionScheme {
    parts: SchemeParts,
    session_key: String,
    user: Option<AuthUser>,
}

impl SessionScheme {
    pub fn new(parts: SchemeParts) -> Self {
        let session_key = parts.config.session_key();
        Self {
            parts,
            session_key,
            user: None,
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Mark the session as authenticated by `user`.
    #[instrument(skip(self, user), fields(scheme = %self.parts.config.name))]
    pub async fn login(&mut self, user: AuthUser) -> AuthResult<()> {
        self.parts
            .ctx
            .session_put(&self.session_key, Value::from(user.id.as_str()))
            .await?;
        debug!("Session login for user {}", user.id);
        self.user = Some(user);
        Ok(())
    }

    /// Log in the user with identifier `id`.
    pub async fn login_via_id(&mut self, id: &UserIdentifier) -> AuthResult<AuthUser> {
        let user = self
            .parts
            .provider
            .find_by_id(id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        self.login(user.clone()).await?;
        Ok(user)
    }

    /// Validate credentials and log the user in.
    pub async fn attempt(
        &mut self,
        uid: &str,
        password: &str,
        constraints: &Constraints,
    ) -> AuthResult<AuthUser> {
        let user = self.validate(uid, password, constraints).await?;
        self.login(user.clone()).await?;
        Ok(user)
    }

    /// Drop the identifier from the session and forget the cached user.
    pub async fn logout(&mut self) -> AuthResult<()> {
        self.parts.ctx.session_forget(&self.session_key).await?;
        self.user = None;
        Ok(())
    }
}

#[async_trait]
impl Scheme for SessionScheme {
    fn name(&self) -> &SchemeName {
        &self.parts.config.name
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::Session
    }

    fn user(&self) -> Option<&AuthUser> {
        self.user.as_ref()
    }

    #[instrument(skip(self), fields(scheme = %self.parts.config.name))]
    async fn authenticate(&mut self) -> AuthResult<AuthUser> {
        if let Some(user) = &self.user {
            return Ok(user.clone());
        }

        let stored = self
            .parts
            .ctx
            .session_get(&self.session_key)
            .await?
            .ok_or(AuthError::MissingCredential)?;

        let Some(id) = UserIdentifier::from_value(&stored) else {
            warn!("Session key {} holds an unusable identifier", self.session_key);
            return Err(AuthError::MissingCredential);
        };

        let user = self
            .parts
            .provider
            .find_by_id(&id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        debug!("Session authenticated user {}", user.id);
        self.user = Some(user.clone());
        Ok(user)
    }

    async fn validate(
        &self,
        uid: &str,
        password: &str,
        constraints: &Constraints,
    ) -> AuthResult<AuthUser> {
        validate_credentials(self.parts.provider.as_ref(), uid, password, constraints).await
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
