use async_trait::async_trait;
use chrono::Utc;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{Scheme, SchemeParts, TokenIssuer, validate_credentials};
use crate::config::SchemeKind;
use crate::context::bearer_token;
use crate::crypto::{OpaqueToken, parse_opaque_token};
use crate::error::{AuthError, AuthResult};
use crate::provider::{AuthUser, Constraints};
use crate::token::{IssuedToken, ProviderToken, TokenOptions, TokenStore, expiry_after};
use crate::types::SchemeName;

/// Label used when `TokenOptions::name` is not set.
pub const DEFAULT_TOKEN_NAME: &str = "Opaque Access Token";

/// Opaque, database-backed bearer tokens.
///
/// The client holds `<lookup id>.<secret>`; the store holds only the hash
/// of the secret.
pub struct ApiScheme {
    parts: SchemeParts,
    tokens: Arc<dyn TokenStore>,
    user: Option<AuthUser>,
    token: Option<ProviderToken>,
}

impl ApiScheme {
    pub fn new(parts: SchemeParts) -> AuthResult<Self> {
        let tokens = parts.provider.tokens().ok_or_else(|| {
            AuthError::config(format!(
                "api scheme `{}` needs a user provider with token storage",
                parts.config.name
            ))
        })?;

        Ok(Self {
            parts,
            tokens,
            user: None,
            token: None,
        })
    }

    /// The token that authenticated this request.
    pub fn token(&self) -> Option<&ProviderToken> {
        self.token.as_ref()
    }

    /// Decode and verify a plaintext token, returning its stored record.
    ///
    /// Malformed, unknown, revoked and expired tokens, and tokens of another
    /// type, all fail with `InvalidToken`.
    #[instrument(skip(self, plaintext), fields(scheme = %self.parts.config.name))]
    pub async fn verify(&self, plaintext: &str) -> AuthResult<ProviderToken> {
        let (lookup_id, hash) =
            parse_opaque_token(plaintext).ok_or_else(|| AuthError::invalid_token("malformed token"))?;

        let token = self
            .parts
            .provider
            .find_by_token(&lookup_id, &hash)
            .await?
            .ok_or_else(|| AuthError::invalid_token("unknown, revoked or expired token"))?;

        if token.token_type != self.parts.config.token_type() {
            return Err(AuthError::invalid_token("token type does not match this scheme"));
        }

        Ok(token)
    }

    /// Revoke the token that authenticated this request.
    #[instrument(skip(self), fields(scheme = %self.parts.config.name))]
    pub async fn revoke(&mut self) -> AuthResult<()> {
        self.authenticate().await?;

        let lookup_id = self
            .token
            .as_ref()
            .and_then(|token| token.lookup_id.clone())
            .ok_or_else(|| AuthError::invalid_token("token has no lookup id"))?;

        self.tokens.destroy(&lookup_id).await?;
        debug!("Revoked token {}", lookup_id);

        self.user = None;
        self.token = None;
        Ok(())
    }

    /// Revoke an arbitrary token. Returns whether a live token was revoked.
    pub async fn revoke_token(&self, plaintext: &str) -> AuthResult<bool> {
        let token = match self.verify(plaintext).await {
            Ok(token) => token,
            Err(e) if e.is_recoverable() => return Ok(false),
            Err(e) => return Err(e),
        };

        match token.lookup_id {
            Some(lookup_id) => {
                self.tokens.destroy(&lookup_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl Scheme for ApiScheme {
    fn name(&self) -> &SchemeName {
        &self.parts.config.name
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::Api
    }

    fn user(&self) -> Option<&AuthUser> {
        self.user.as_ref()
    }

    #[instrument(skip(self), fields(scheme = %self.parts.config.name))]
    async fn authenticate(&mut self) -> AuthResult<AuthUser> {
        if let Some(user) = &self.user {
            return Ok(user.clone());
        }

        let plaintext = bearer_token(self.parts.ctx.as_ref()).ok_or(AuthError::MissingCredential)?;
        let mut token = self.verify(&plaintext).await?;

        let user = match token.owner.take() {
            Some(owner) => owner,
            None => self
                .parts
                .provider
                .find_by_id(&token.owner_id)
                .await?
                .ok_or(AuthError::UserNotFound)?,
        };

        debug!("API token accepted for user {}", user.id);
        self.user = Some(user.clone());
        self.token = Some(token);
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

    fn as_token_issuer(&mut self) -> Option<&mut dyn TokenIssuer> {
        Some(self)
    }
}

#[async_trait]
impl TokenIssuer for ApiScheme {
    #[instrument(skip(self, user, options), fields(scheme = %self.parts.config.name))]
    async fn generate(&self, user: &AuthUser, options: TokenOptions) -> AuthResult<IssuedToken> {
        let mut opaque = OpaqueToken::generate();
        let expires_at = options
            .expires_in
            .or_else(|| self.parts.config.expires_in())
            .map(|lifetime| expiry_after(Utc::now(), lifetime))
            .transpose()?;

        let mut record = ProviderToken::new(
            options.name.unwrap_or_else(|| DEFAULT_TOKEN_NAME.to_string()),
            opaque.hash.clone(),
            user.id.clone(),
            self.parts.config.token_type(),
        )
        .with_expiry(expires_at)
        .with_meta(options.meta);
        record.lookup_id = Some(opaque.lookup_id.clone());

        let lookup_id = self.tokens.write(&record).await?;
        opaque.lookup_id = lookup_id.clone();
        record.lookup_id = Some(lookup_id);

        debug!("Issued API token for user {}", user.id);
        let mut issued = IssuedToken::bearer(opaque.plaintext(), expires_at);
        issued.record = Some(record);
        Ok(issued)
    }
}
