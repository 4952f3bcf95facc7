//! Scheme registry built once from configuration.
//!
//! The manager validates every configured scheme up front, resolves model
//! names through the [`ModelRegistry`] and keeps one provider factory per
//! scheme. After `build()` it is immutable and shared across requests.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::Auth;
use crate::config::{AuthSettings, ResolvedScheme, SchemeKind, UserSource};
use crate::context::RequestContext;
use crate::db::{DatabaseTokenStore, Db, SchemaTables};
use crate::error::{AuthError, AuthResult};
use crate::hashing::{Argon2Hasher, PasswordHasher};
use crate::provider::{
    Model, ModelRegistry, ProviderFactory, ProviderParts, TableColumns, TableProvider,
    UserProvider,
};
use crate::scheme::{Scheme, SchemeParts, basic_challenge, build_scheme};
use crate::types::SchemeName;

struct SchemeEntry {
    config: Arc<ResolvedScheme>,
    parts: ProviderParts,
    factory: ProviderFactory,
    /// `(table, primary key)` the provider reads users from.
    user_table: Option<(String, String)>,
}

/// Immutable registry of configured schemes.
pub struct AuthManager {
    schemes: HashMap<SchemeName, SchemeEntry>,
    default_scheme: SchemeName,
    fallback: Vec<SchemeName>,
    db: Db,
    hasher: Arc<dyn PasswordHasher>,
}

impl AuthManager {
    pub fn builder(settings: AuthSettings) -> AuthManagerBuilder {
        AuthManagerBuilder {
            settings,
            db: None,
            hasher: None,
            models: ModelRegistry::new(),
        }
    }

    /// Create the per-request façade.
    pub fn auth(self: &Arc<Self>, ctx: Arc<dyn RequestContext>) -> Auth {
        Auth::new(self.clone(), ctx)
    }

    pub fn default_scheme(&self) -> &SchemeName {
        &self.default_scheme
    }

    /// Configured fallback order; empty when none is configured.
    pub fn fallback(&self) -> &[SchemeName] {
        &self.fallback
    }

    /// Schemes to try for `names`: the list itself, else the configured
    /// fallback order, else the default scheme alone.
    ///
    /// Repeated names keep their first position only.
    pub fn fallback_order(&self, names: &[SchemeName]) -> Vec<SchemeName> {
        let names = if !names.is_empty() {
            names
        } else if !self.fallback.is_empty() {
            &self.fallback
        } else {
            std::slice::from_ref(&self.default_scheme)
        };

        let mut order: Vec<SchemeName> = Vec::with_capacity(names.len());
        for name in names {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemes.contains_key(name)
    }

    pub fn scheme_names(&self) -> Vec<SchemeName> {
        let mut names: Vec<SchemeName> = self.schemes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn config(&self, name: &str) -> AuthResult<&ResolvedScheme> {
        self.entry(name).map(|entry| entry.config.as_ref())
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn hasher(&self) -> Arc<dyn PasswordHasher> {
        self.hasher.clone()
    }

    fn entry(&self, name: &str) -> AuthResult<&SchemeEntry> {
        self.schemes
            .get(name)
            .ok_or_else(|| AuthError::config(format!("scheme `{}` is not configured", name)))
    }

    /// A fresh provider for `name`.
    pub fn provider(&self, name: &str) -> AuthResult<Arc<dyn UserProvider>> {
        let entry = self.entry(name)?;
        Ok((entry.factory)(&entry.parts))
    }

    /// Construct a new scheme instance for `name`, bound to `ctx`.
    pub fn instantiate(&self, name: &str, ctx: Arc<dyn RequestContext>) -> AuthResult<Box<dyn Scheme>> {
        let entry = self.entry(name)?;
        debug!("Instantiating scheme {} ({})", name, entry.config.kind);

        build_scheme(SchemeParts {
            config: entry.config.clone(),
            provider: (entry.factory)(&entry.parts),
            ctx,
        })
    }

    /// `WWW-Authenticate` value for the first Basic scheme among `names`.
    pub fn challenge_for(&self, names: &[SchemeName]) -> Option<String> {
        names
            .iter()
            .filter_map(|name| self.schemes.get(name))
            .find(|entry| entry.config.kind == SchemeKind::Basic)
            .map(|entry| basic_challenge(entry.config.options.realm.as_deref()))
    }

    /// One store per distinct token table.
    pub fn token_stores(&self) -> Vec<Arc<DatabaseTokenStore>> {
        let mut seen = BTreeSet::new();
        let mut entries: Vec<&SchemeEntry> = self.schemes.values().collect();
        entries.sort_by(|a, b| a.config.name.cmp(&b.config.name));

        entries
            .into_iter()
            .filter(|entry| seen.insert(entry.config.token_table.clone()))
            .map(|entry| entry.parts.tokens.clone())
            .collect()
    }

    /// Every table the configured schemes use.
    pub fn schema_tables(&self) -> SchemaTables {
        let mut users = BTreeSet::new();
        let mut tokens = BTreeSet::new();

        for entry in self.schemes.values() {
            if let Some(table) = &entry.user_table {
                users.insert(table.clone());
            }
            if entry.config.kind == SchemeKind::Api {
                tokens.insert(entry.config.token_table.clone());
            }
        }

        SchemaTables {
            users: users.into_iter().collect(),
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthManager")
            .field("schemes", &self.scheme_names())
            .field("default_scheme", &self.default_scheme)
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Builder for [`AuthManager`].
pub struct AuthManagerBuilder {
    settings: AuthSettings,
    db: Option<Db>,
    hasher: Option<Arc<dyn PasswordHasher>>,
    models: ModelRegistry,
}

impl AuthManagerBuilder {
    pub fn database(mut self, db: Db) -> Self {
        self.db = Some(db);
        self
    }

    /// Password hashing capability (default: Argon2id).
    pub fn hasher(mut self, hasher: Arc<dyn PasswordHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Make `M` available to the `model` serializer under `name`.
    pub fn model<M: Model>(mut self, name: &str) -> Self {
        self.models.register::<M>(name);
        self
    }

    /// Replace the model registry wholesale.
    pub fn models(mut self, models: ModelRegistry) -> Self {
        self.models = models;
        self
    }

    /// Validate the configuration and build the registry.
    pub fn build(self) -> AuthResult<AuthManager> {
        let db = self
            .db
            .ok_or_else(|| AuthError::config("no database handle was provided"))?;
        let hasher = self
            .hasher
            .unwrap_or_else(|| Arc::new(Argon2Hasher::default()) as Arc<dyn PasswordHasher>);

        let resolved = self.settings.resolve()?;
        let mut token_stores: HashMap<String, Arc<DatabaseTokenStore>> = HashMap::new();
        let mut schemes = HashMap::with_capacity(resolved.len());

        for config in resolved {
            let tokens = token_stores
                .entry(config.token_table.clone())
                .or_insert_with(|| Arc::new(DatabaseTokenStore::new(db.clone(), config.token_table.clone())))
                .clone();

            let parts = ProviderParts {
                db: db.clone(),
                hasher: hasher.clone(),
                uids: config.uids.clone(),
                tokens,
            };

            let (factory, user_table): (ProviderFactory, _) = match &config.source {
                UserSource::Table(table) => {
                    let columns = TableColumns {
                        table: table.clone(),
                        primary_key: config.primary_key.clone(),
                        password_field: config.password_field.clone(),
                    };
                    let user_table = Some((columns.table.clone(), columns.primary_key.clone()));
                    let factory: ProviderFactory = Arc::new(move |parts: &ProviderParts| {
                        Arc::new(TableProvider::new(parts.clone(), columns.clone())) as Arc<dyn UserProvider>
                    });
                    (factory, user_table)
                }
                UserSource::Model(model) => (
                    self.models.resolve(model)?,
                    self.models.table(model),
                ),
            };

            if config.kind == SchemeKind::Api && factory(&parts).tokens().is_none() {
                return Err(AuthError::config(format!(
                    "api scheme `{}` needs a user provider with token storage",
                    config.name
                )));
            }

            schemes.insert(
                config.name.clone(),
                SchemeEntry {
                    config: Arc::new(config),
                    parts,
                    factory,
                    user_table,
                },
            );
        }

        let manager = AuthManager {
            default_scheme: SchemeName::new(self.settings.authenticator.clone()),
            fallback: self
                .settings
                .fallback
                .iter()
                .map(|name| SchemeName::new(name.as_str()))
                .collect(),
            schemes,
            db,
            hasher,
        };
        info!(
            "Auth manager ready: {} schemes, default `{}`",
            manager.schemes.len(),
            manager.default_scheme
        );
        Ok(manager)
    }
}

/// Define every table the manager's schemes use.
pub async fn ensure_schema(db: &Db, manager: &AuthManager) -> anyhow::Result<()> {
    crate::db::ensure_schema(db, &manager.schema_tables()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MemoryContext;
    use crate::test_utils::{SAMPLE_CONFIG, TestUser, memory_db, test_hasher};

    async fn build(raw: &str) -> AuthResult<AuthManager> {
        AuthManager::builder(AuthSettings::from_json_str(raw)?)
            .database(memory_db().await)
            .hasher(test_hasher())
            .model::<TestUser>("User")
            .build()
    }

    #[tokio::test]
    async fn test_build_from_sample_config() {
        let manager = build(SAMPLE_CONFIG).await.unwrap();

        assert_eq!(manager.default_scheme().as_str(), "web");
        assert_eq!(manager.fallback(), &[SchemeName::new("jwt"), SchemeName::new("api")]);
        assert_eq!(manager.scheme_names().len(), 5);
        assert_eq!(manager.config("jwt").unwrap().kind, SchemeKind::Jwt);
        assert!(manager.contains("basic"));
        assert!(!manager.contains("nope"));
    }

    #[tokio::test]
    async fn test_fallback_order_resolution() {
        let manager = build(SAMPLE_CONFIG).await.unwrap();
        let names = |list: &[&str]| list.iter().map(|n| SchemeName::new(*n)).collect::<Vec<_>>();

        assert_eq!(manager.fallback_order(&[]), names(&["jwt", "api"]));
        assert_eq!(
            manager.fallback_order(&names(&["basic", "jwt", "basic", "web", "jwt"])),
            names(&["basic", "jwt", "web"])
        );
    }

    #[tokio::test]
    async fn test_instantiate_each_kind() {
        let manager = build(SAMPLE_CONFIG).await.unwrap();
        let ctx: Arc<dyn RequestContext> = Arc::new(MemoryContext::new());

        for (name, kind) in [
            ("web", SchemeKind::Session),
            ("basic", SchemeKind::Basic),
            ("jwt", SchemeKind::Jwt),
            ("api", SchemeKind::Api),
            ("models", SchemeKind::Api),
        ] {
            let scheme = manager.instantiate(name, ctx.clone()).unwrap();
            assert_eq!(scheme.kind(), kind);
            assert_eq!(scheme.name().as_str(), name);
        }

        assert!(matches!(
            manager.instantiate("missing", ctx),
            Err(AuthError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_model_fails_at_build() {
        let raw = r#"{
            "authenticator": "api",
            "api": { "scheme": "api", "serializer": "model", "model": "Admin" }
        }"#;
        let err = build(raw).await.unwrap_err();
        assert!(matches!(err, AuthError::Configuration(ref msg) if msg.contains("Admin")));
    }

    #[tokio::test]
    async fn test_missing_database_fails_at_build() {
        let settings = AuthSettings::from_json_str(SAMPLE_CONFIG).unwrap();
        let err = AuthManager::builder(settings).build().unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_schema_tables_and_stores() {
        let manager = build(SAMPLE_CONFIG).await.unwrap();
        let tables = manager.schema_tables();

        assert_eq!(tables.users, vec![("users".to_string(), "uid".to_string())]);
        assert_eq!(tables.tokens, vec!["auth_tokens".to_string(), "model_tokens".to_string()]);
        assert_eq!(manager.token_stores().len(), 2);

        ensure_schema(manager.db(), &manager).await.unwrap();
    }

    #[tokio::test]
    async fn test_challenge_for() {
        let manager = build(SAMPLE_CONFIG).await.unwrap();
        assert_eq!(
            manager.challenge_for(&[SchemeName::new("jwt"), SchemeName::new("basic")]),
            Some("Basic realm=\"admin\", charset=\"UTF-8\"".to_string())
        );
        assert_eq!(manager.challenge_for(&[SchemeName::new("jwt")]), None);
    }
}
