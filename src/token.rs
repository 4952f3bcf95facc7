//! Issued tokens and the storage contract behind them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AuthError, AuthResult};
use crate::provider::AuthUser;
use crate::types::{TokenHash, TokenLookupId, UserIdentifier};

/// Upper bound for token lifetimes (100 years).
pub const MAX_TOKEN_LIFETIME: Duration = Duration::days(100 * 365);

/// Expiry instant `lifetime` after `now`, with the lifetime capped at
/// [`MAX_TOKEN_LIFETIME`].
pub fn expiry_after(now: DateTime<Utc>, lifetime: Duration) -> AuthResult<DateTime<Utc>> {
    now.checked_add_signed(lifetime.min(MAX_TOKEN_LIFETIME))
        .ok_or_else(|| AuthError::config("token lifetime out of range"))
}

/// One issued token, as persisted (hash only) or read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderToken {
    /// Human-readable label (e.g. "cli", "Opaque Access Token").
    pub name: String,
    /// Digest of the secret half; never the plaintext.
    pub token_hash: TokenHash,
    /// Identifier of the user the token was issued to.
    pub owner_id: UserIdentifier,
    /// Token flavour, used to keep e.g. api tokens and refresh tokens apart.
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    /// Every non-reserved column of the row.
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Set once the token has been written or read from a store.
    #[serde(default)]
    pub lookup_id: Option<TokenLookupId>,
    /// Owner record, when the provider eager-loaded it.
    #[serde(skip)]
    pub owner: Option<AuthUser>,
}

impl ProviderToken {
    pub fn new(
        name: impl Into<String>,
        token_hash: TokenHash,
        owner_id: UserIdentifier,
        token_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            token_hash,
            owner_id,
            token_type: token_type.into(),
            expires_at: None,
            created_at: None,
            meta: Map::new(),
            lookup_id: None,
            owner: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = meta;
        self
    }

    /// A token is expired once `expires_at` is not later than `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Persistence for hashed tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fetch a token by lookup id and check the supplied hash in constant time.
    ///
    /// Returns `None` when the row is missing, the hash differs or the token
    /// is expired. Expired rows are left in place.
    async fn read(
        &self,
        lookup_id: &TokenLookupId,
        supplied_hash: &TokenHash,
    ) -> AuthResult<Option<ProviderToken>>;

    /// Persist a token and return its lookup id.
    async fn write(&self, token: &ProviderToken) -> AuthResult<TokenLookupId>;

    /// Remove a token. Removing an unknown id is not an error.
    async fn destroy(&self, lookup_id: &TokenLookupId) -> AuthResult<()>;
}

/// Options accepted by token-issuing schemes.
#[derive(Debug, Clone, Default)]
pub struct TokenOptions {
    /// Label stored with the token.
    pub name: Option<String>,
    /// Overrides the scheme's configured lifetime.
    pub expires_in: Option<Duration>,
    /// Extra columns (api tokens) or claims (jwt).
    pub meta: Map<String, Value>,
}

impl TokenOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }
}

/// A token handed back to the client right after issuance.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    /// Plaintext value. This is the only time it exists outside the client.
    pub token: String,
    /// Always "bearer".
    #[serde(rename = "type")]
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    /// Persisted record for store-backed tokens.
    #[serde(skip)]
    pub record: Option<ProviderToken>,
}

impl IssuedToken {
    pub fn bearer(token: String, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token,
            token_type: "bearer".to_string(),
            expires_at,
            record: None,
        }
    }
}
