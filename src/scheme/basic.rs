use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::any::Any;
use tracing::{debug, instrument};

use super::{Scheme, SchemeParts, validate_credentials};
use crate::config::SchemeKind;
use crate::error::{AuthError, AuthResult};
use crate::provider::{AuthUser, Constraints};
use crate::types::SchemeName;

const DEFAULT_REALM: &str = "Login";

/// `WWW-Authenticate` value for a Basic challenge.
pub fn basic_challenge(realm: Option<&str>) -> String {
    let realm = realm.unwrap_or(DEFAULT_REALM).replace('"', "");
    format!("Basic realm=\"{}\", charset=\"UTF-8\"", realm)
}

/// HTTP Basic: credentials travel with every request and are validated
/// once per instance.
pub struct BasicScheme {
    parts: SchemeParts,
    user: Option<AuthUser>,
}

impl BasicScheme {
    pub fn new(parts: SchemeParts) -> Self {
        Self { parts, user: None }
    }

    pub fn challenge(&self) -> String {
        basic_challenge(self.parts.config.options.realm.as_deref())
    }

    /// Decode `Authorization: Basic ...` into `(uid, password)`.
    fn credentials(&self) -> AuthResult<(String, String)> {
        let header = self
            .parts
            .ctx
            .header("authorization")
            .ok_or(AuthError::MissingCredential)?;

        let Some((scheme, encoded)) = header.trim().split_once(' ') else {
            return Err(AuthError::MissingCredential);
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(AuthError::MissingCredential);
        }

        let decoded = STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| AuthError::invalid_token("malformed basic credentials"))?;

        let (uid, password) = decoded
            .split_once(':')
            .ok_or_else(|| AuthError::invalid_token("malformed basic credentials"))?;

        Ok((uid.to_string(), password.to_string()))
    }
}

#[async_trait]
impl Scheme for BasicScheme {
    fn name(&self) -> &SchemeName {
        &self.parts.config.name
    }

    fn kind(&self) -> SchemeKind {
        SchemeKind::Basic
    }

    fn user(&self) -> Option<&AuthUser> {
        self.user.as_ref()
    }

    #[instrument(skip(self), fields(scheme = %self.parts.config.name))]
    async fn authenticate(&mut self) -> AuthResult<AuthUser> {
        if let Some(user) = &self.user {
            return Ok(user.clone());
        }

        let (uid, password) = self.credentials()?;
        let user = self.validate(&uid, &password, &Constraints::new()).await?;

        debug!("Basic credentials accepted for user {}", user.id);
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
