//! Typed model providers and the registry that resolves them by name.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::table::find_by_id_query;
use super::{
    AuthUser, Constraints, ProviderParts, UserProvider, credentials_query, fetch_users,
    verify_password,
};
use crate::error::{AuthError, AuthResult};
use crate::token::{ProviderToken, TokenStore};
use crate::types::{TokenHash, TokenLookupId, UserIdentifier};

/// A user record type bound to a table.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct User { uid: String, email: String, password: String }
///
/// impl Model for User {
///     const TABLE: &'static str = "users";
/// }
/// ```
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;
    const PRIMARY_KEY: &'static str = "uid";
    const PASSWORD_FIELD: &'static str = "password";
}

/// Provider backed by a [`Model`].
///
/// Rows that do not deserialize into `M` are treated as absent.
pub struct ModelProvider<M: Model> {
    parts: ProviderParts,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> ModelProvider<M> {
    pub fn new(parts: ProviderParts) -> Self {
        Self {
            parts,
            _model: PhantomData,
        }
    }

    /// Typed lookup by identifier.
    pub async fn find(&self, id: &UserIdentifier) -> AuthResult<Option<M>> {
        match self.find_by_id(id).await? {
            Some(user) => Ok(Some(user.to_model()?)),
            None => Ok(None),
        }
    }

    fn keep_valid(users: Vec<AuthUser>) -> Option<AuthUser> {
        users.into_iter().find(|user| match user.to_model::<M>() {
            Ok(_) => true,
            Err(e) => {
                warn!("Row in {} does not match its model: {}", M::TABLE, e);
                false
            }
        })
    }
}

impl<M: Model> Clone for ModelProvider<M> {
    fn clone(&self) -> Self {
        Self::new(self.parts.clone())
    }
}

#[async_trait]
impl<M: Model> UserProvider for ModelProvider<M> {
    fn primary_key(&self) -> &str {
        M::PRIMARY_KEY
    }

    #[instrument(skip(self), fields(model = M::TABLE))]
    async fn find_by_id(&self, id: &UserIdentifier) -> AuthResult<Option<AuthUser>> {
        let (query, bindings) = find_by_id_query(M::TABLE, M::PRIMARY_KEY, id);
        let users = fetch_users(&self.parts.db, query, bindings, M::PRIMARY_KEY).await?;
        Ok(Self::keep_valid(users))
    }

    #[instrument(skip(self, uid, constraints), fields(model = M::TABLE))]
    async fn find_by_credentials(
        &self,
        uid: &str,
        constraints: &Constraints,
    ) -> AuthResult<Option<AuthUser>> {
        let (query, bindings) = credentials_query(M::TABLE, &self.parts.uids, uid, constraints)?;
        let users = fetch_users(&self.parts.db, query, bindings, M::PRIMARY_KEY).await?;
        Ok(Self::keep_valid(users))
    }

    async fn validate_credentials(&self, user: &AuthUser, password: &str) -> AuthResult<bool> {
        verify_password(&self.parts.hasher, user, M::PASSWORD_FIELD, password).await
    }

    fn tokens(&self) -> Option<Arc<dyn TokenStore>> {
        Some(self.parts.tokens.clone())
    }

    /// Reads the token and eager-loads its owner. A token whose owner is gone
    /// resolves to `None`.
    async fn find_by_token(
        &self,
        lookup_id: &TokenLookupId,
        hash: &TokenHash,
    ) -> AuthResult<Option<ProviderToken>> {
        let Some(mut token) = self.parts.tokens.read(lookup_id, hash).await? else {
            return Ok(None);
        };

        match self.find_by_id(&token.owner_id).await? {
            Some(owner) => {
                token.owner = Some(owner);
                Ok(Some(token))
            }
            None => {
                debug!("Token owner {} no longer exists", token.owner_id);
                Ok(None)
            }
        }
    }
}

/// Builds a provider for one scheme from the manager's shared parts.
pub type ProviderFactory = Arc<dyn Fn(&ProviderParts) -> Arc<dyn UserProvider> + Send + Sync>;

/// Model names available to the `model` serializer.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    factories: HashMap<String, ProviderFactory>,
    /// `(table, primary key)` of typed models, for schema bootstrap.
    tables: HashMap<String, (String, String)>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M` under `name`.
    pub fn register<M: Model>(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        self.tables.insert(
            name.clone(),
            (M::TABLE.to_string(), M::PRIMARY_KEY.to_string()),
        );
        self.register_factory(name, |parts: &ProviderParts| {
            Arc::new(ModelProvider::<M>::new(parts.clone())) as Arc<dyn UserProvider>
        })
    }

    /// Register an arbitrary provider constructor under `name`.
    pub fn register_factory<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ProviderParts) -> Arc<dyn UserProvider> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn resolve(&self, name: &str) -> AuthResult<ProviderFactory> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| AuthError::config(format!("model `{}` is not registered", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Table a model registered with [`ModelRegistry::register`] reads from.
    pub(crate) fn table(&self, name: &str) -> Option<(String, String)> {
        self.tables.get(name).cloned()
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ModelRegistry").field("models", &names).finish()
    }
}
