//! Provider over an arbitrary table, configured by column names.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{
    AuthUser, Constraints, ProviderParts, UserProvider, credentials_query, fetch_users,
    verify_password,
};
use crate::error::AuthResult;
use crate::token::TokenStore;
use crate::types::UserIdentifier;

/// Table and column names for a [`TableProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumns {
    pub table: String,
    pub primary_key: String,
    pub password_field: String,
}

/// Generic table-backed user provider.
#[derive(Clone)]
pub struct TableProvider {
    parts: ProviderParts,
    columns: TableColumns,
}

impl TableProvider {
    pub fn new(parts: ProviderParts, columns: TableColumns) -> Self {
        Self { parts, columns }
    }

    pub fn columns(&self) -> &TableColumns {
        &self.columns
    }
}

/// Values an identifier may be stored as: its string form, and the number it
/// spells if it is numeric.
pub(crate) fn id_candidates(id: &UserIdentifier) -> Value {
    let mut candidates = vec![Value::from(id.as_str())];
    if let Ok(n) = id.as_str().parse::<i64>() {
        candidates.push(Value::from(n));
    }
    Value::Array(candidates)
}

pub(crate) fn find_by_id_query(table: &str, primary_key: &str, id: &UserIdentifier) -> (String, Map<String, Value>) {
    let mut bindings = Map::new();
    bindings.insert("table".into(), Value::from(table));
    bindings.insert("pk".into(), Value::from(primary_key));
    bindings.insert("ids".into(), id_candidates(id));

    (
        "SELECT * OMIT id FROM type::table($table) WHERE type::field($pk) IN $ids LIMIT 1".to_string(),
        bindings,
    )
}

#[async_trait]
impl UserProvider for TableProvider {
    fn primary_key(&self) -> &str {
        &self.columns.primary_key
    }

    #[instrument(skip(self), fields(table = %self.columns.table))]
    async fn find_by_id(&self, id: &UserIdentifier) -> AuthResult<Option<AuthUser>> {
        let (query, bindings) = find_by_id_query(&self.columns.table, &self.columns.primary_key, id);
        let users = fetch_users(&self.parts.db, query, bindings, &self.columns.primary_key).await?;
        Ok(users.into_iter().next())
    }

    #[instrument(skip(self, uid, constraints), fields(table = %self.columns.table))]
    async fn find_by_credentials(
        &self,
        uid: &str,
        constraints: &Constraints,
    ) -> AuthResult<Option<AuthUser>> {
        let (query, bindings) =
            credentials_query(&self.columns.table, &self.parts.uids, uid, constraints)?;
        let users = fetch_users(&self.parts.db, query, bindings, &self.columns.primary_key).await?;
        if users.is_empty() {
            debug!("No user matches the supplied credentials");
        }
        Ok(users.into_iter().next())
    }

    async fn validate_credentials(&self, user: &AuthUser, password: &str) -> AuthResult<bool> {
        verify_password(&self.parts.hasher, user, &self.columns.password_field, password).await
    }

    fn tokens(&self) -> Option<Arc<dyn TokenStore>> {
        Some(self.parts.tokens.clone())
    }
}
