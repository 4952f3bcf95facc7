//! Shared fixtures for unit tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{
    AuthSettings, DEFAULT_PASSWORD_FIELD, DEFAULT_PRIMARY_KEY, DEFAULT_TOKEN_TABLE, ResolvedScheme,
    SchemeKind, SchemeOptions, UserSource,
};
use crate::context::RequestContext;
use crate::db::{DatabaseConfig, DatabaseTokenStore, Db, create_connection};
use crate::error::AuthResult;
use crate::hashing::{Argon2Hasher, Argon2Params, PasswordHasher};
use crate::manager::AuthManager;
use crate::provider::{
    AuthUser, Constraints, Model, ProviderParts, TableColumns, TableProvider, UserProvider,
};
use crate::scheme::SchemeParts;
use crate::token::{ProviderToken, TokenStore};
use crate::types::{SchemeName, TokenHash, TokenLookupId, UserIdentifier};

pub const TEST_JWT_SECRET: &str = "test-secret-with-enough-entropy";

/// Configuration covering every scheme kind over a `users` table.
pub const SAMPLE_CONFIG: &str = r#"{
    "authenticator": "web",
    "fallback": ["jwt", "api"],
    "web": { "scheme": "session", "serializer": "table", "table": "users" },
    "basic": { "scheme": "basic", "serializer": "table", "table": "users", "options": { "realm": "admin" } },
    "jwt": { "scheme": "jwt", "serializer": "table", "table": "users", "secret": "test-secret-with-enough-entropy" },
    "api": { "scheme": "api", "serializer": "table", "table": "users" },
    "models": { "scheme": "api", "serializer": "model", "model": "User", "tokens": "model_tokens" }
}"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestUser {
    pub uid: String,
    pub email: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl Model for TestUser {
    const TABLE: &'static str = "users";
}

pub async fn memory_db() -> Db {
    let config = DatabaseConfig {
        url: "memory".to_string(),
        namespace: "test".to_string(),
        database: "test".to_string(),
        username: None,
        password: None,
    };
    create_connection(config).await.unwrap()
}

pub fn test_hasher() -> Arc<dyn PasswordHasher> {
    Arc::new(Argon2Hasher::new(Argon2Params::insecure_fast()))
}

pub async fn test_parts() -> ProviderParts {
    let db = memory_db().await;
    ProviderParts {
        tokens: Arc::new(DatabaseTokenStore::new(db.clone(), DEFAULT_TOKEN_TABLE)),
        db,
        hasher: test_hasher(),
        uids: vec!["email".to_string()],
    }
}

/// Insert a user row, hashing `password` into the `password` column.
pub async fn seed_user(db: &Db, table: &str, mut row: Value, password: Option<&str>) {
    if let (Some(password), Some(fields)) = (password, row.as_object_mut()) {
        let hash = test_hasher().hash(password).unwrap();
        fields.insert(DEFAULT_PASSWORD_FIELD.to_string(), Value::from(hash));
    }

    db.query("CREATE type::table($table) CONTENT $row")
        .bind(("table", table.to_string()))
        .bind(("row", row))
        .await
        .unwrap()
        .check()
        .unwrap();
}

pub fn table_provider(parts: &ProviderParts, table: &str) -> TableProvider {
    TableProvider::new(
        parts.clone(),
        TableColumns {
            table: table.to_string(),
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            password_field: DEFAULT_PASSWORD_FIELD.to_string(),
        },
    )
}

pub fn resolved_scheme(name: &str, kind: SchemeKind, options: SchemeOptions) -> ResolvedScheme {
    ResolvedScheme {
        name: SchemeName::new(name),
        kind,
        source: UserSource::Table("users".to_string()),
        primary_key: DEFAULT_PRIMARY_KEY.to_string(),
        uids: vec!["email".to_string()],
        password_field: DEFAULT_PASSWORD_FIELD.to_string(),
        secret: Some(TEST_JWT_SECRET.to_string()),
        token_table: DEFAULT_TOKEN_TABLE.to_string(),
        options,
    }
}

pub fn scheme_parts_with(
    parts: &ProviderParts,
    name: &str,
    kind: SchemeKind,
    options: SchemeOptions,
    ctx: Arc<dyn RequestContext>,
) -> SchemeParts {
    SchemeParts {
        config: Arc::new(resolved_scheme(name, kind, options)),
        provider: Arc::new(table_provider(parts, "users")),
        ctx,
    }
}

pub fn scheme_parts(
    parts: &ProviderParts,
    name: &str,
    kind: SchemeKind,
    ctx: Arc<dyn RequestContext>,
) -> SchemeParts {
    scheme_parts_with(parts, name, kind, SchemeOptions::default(), ctx)
}

/// Manager over [`SAMPLE_CONFIG`] and a fresh in-memory database.
pub async fn test_manager() -> Arc<AuthManager> {
    let settings = AuthSettings::from_json_str(SAMPLE_CONFIG).unwrap();
    let manager = AuthManager::builder(settings)
        .database(memory_db().await)
        .hasher(test_hasher())
        .model::<TestUser>("User")
        .build()
        .unwrap();
    Arc::new(manager)
}

/// Provider wrapper counting store lookups.
pub struct CountingProvider {
    inner: Arc<dyn UserProvider>,
    lookups: AtomicUsize,
}

impl CountingProvider {
    pub fn new(inner: Arc<dyn UserProvider>) -> Self {
        Self {
            inner,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.lookups.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserProvider for CountingProvider {
    fn primary_key(&self) -> &str {
        self.inner.primary_key()
    }

    async fn find_by_id(&self, id: &UserIdentifier) -> AuthResult<Option<AuthUser>> {
        self.count();
        self.inner.find_by_id(id).await
    }

    async fn find_by_credentials(
        &self,
        uid: &str,
        constraints: &Constraints,
    ) -> AuthResult<Option<AuthUser>> {
        self.count();
        self.inner.find_by_credentials(uid, constraints).await
    }

    async fn validate_credentials(&self, user: &AuthUser, password: &str) -> AuthResult<bool> {
        self.inner.validate_credentials(user, password).await
    }

    fn tokens(&self) -> Option<Arc<dyn TokenStore>> {
        self.inner.tokens()
    }

    async fn find_by_token(
        &self,
        lookup_id: &TokenLookupId,
        hash: &TokenHash,
    ) -> AuthResult<Option<ProviderToken>> {
        self.count();
        self.inner.find_by_token(lookup_id, hash).await
    }
}
