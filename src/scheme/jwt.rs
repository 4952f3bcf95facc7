use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use tracing::{debug, instrument};

use super::{Scheme, SchemeParts, TokenIssuer, validate_credentials};
use crate::config::{DEFAULT_TOKEN_TTL_SECONDS, SchemeKind};
use crate::context::bearer_token;
use crate::error::{AuthError, AuthResult};
use crate::provider::{AuthUser, Constraints};
use crate::token::{IssuedToken, TokenOptions, expiry_after};
use crate::types::{SchemeName, UserIdentifier};

/// Claims carried by tokens this scheme issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwtClaims {
    /// User identifier
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Custom claims from `TokenOptions::meta`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stateless HS256 bearer tokens signed with the scheme's secret.
pub struct JwtScheme {
    parts: SchemeParts,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    user: Option<AuthUser>,
    claims: Option<JwtClaims>,
}

impl JwtScheme {
    pub fn new(parts: SchemeParts) -> AuthResult<Self> {
        let secret = parts.config.secret.clone().ok_or_else(|| {
            AuthError::config(format!("jwt scheme `{}` requires a `secret`", parts.config.name))
        })?;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            parts,
            user: None,
            claims: None,
        })
    }

    fn validation(&self) -> Validation {
        let options = &self.parts.config.options;
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        // A configured iss/aud is only checked when the claim is present,
        // so it must also be required.
        let mut required = vec!["exp", "sub"];
        if let Some(issuer) = &options.issuer {
            validation.set_issuer(&[issuer]);
            required.push("iss");
        }
        match &options.audience {
            Some(audience) => {
                validation.set_audience(&[audience]);
                required.push("aud");
            }
            None => validation.validate_aud = false,
        }
        validation.set_required_spec_claims(&required);

        validation
    }

    /// Verify signature and claims of `token`.
    ///
    /// Fails with `InvalidToken` for malformed, tampered or expired tokens.
    pub fn decode(&self, token: &str) -> AuthResult<JwtClaims> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation())?;
        Ok(data.claims)
    }

    /// Claims of the token that authenticated this request.
    pub fn claims(&self) -> Option<&JwtClaims> {
        self.claims.as_ref()
    }

    fn lifetime(&self, options: &TokenOptions) -> Duration {
        options
            .expires_in
            .or_else(|| self.parts.config.expires_in())
            .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_TTL_SECONDS as i64))
    }
}

#[async_trait]
impl Scheme for JwtScheme {
    fn name(&self) -> &SchemeName {
        &self.parts.config.name
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::Jwt
    }

    fn user(&self) -> Option<&AuthUser> {
        self.user.as_ref()
    }

    #[instrument(skip(self), fields(scheme = %self.parts.config.name))]
    async fn authenticate(&mut self) -> AuthResult<AuthUser> {
        if let Some(user) = &self.user {
            return Ok(user.clone());
        }

        let token = bearer_token(self.parts.ctx.as_ref()).ok_or(AuthError::MissingCredential)?;
        let claims = self.decode(&token)?;

        let user = self
            .parts
            .provider
            .find_by_id(&UserIdentifier::new(claims.sub.clone()))
            .await?
            .ok_or(AuthError::UserNotFound)?;

        debug!("JWT verified for user {}", user.id);
        self.user = Some(user.clone());
        self.claims = Some(claims);
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
impl TokenIssuer for JwtScheme {
    #[instrument(skip(self, user, options), fields(scheme = %self.parts.config.name))]
    async fn generate(&self, user: &AuthUser, options: TokenOptions) -> AuthResult<IssuedToken> {
        let now = Utc::now();
        let expires_at = expiry_after(now, self.lifetime(&options))?;

        let mut extra = options.meta;
        for reserved in ["sub", "exp", "iat", "iss", "aud"] {
            extra.remove(reserved);
        }

        let claims = JwtClaims {
            sub: user.id.as_str().to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            iss: self.parts.config.options.issuer.clone(),
            aud: self.parts.config.options.audience.clone(),
            extra,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        debug!("Issued JWT for user {}", user.id);
        Ok(IssuedToken::bearer(token, Some(expires_at)))
    }
}
