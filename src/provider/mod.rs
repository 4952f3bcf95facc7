//! User providers: the bridge between schemes and a user store.
//!
//! A scheme never queries users directly. It asks its `UserProvider` to
//! resolve an identifier, a credential lookup or a token, and to verify a
//! password. Two providers ship with the crate:
//!
//! - [`TableProvider`]: arbitrary table and column names from configuration
//! - [`ModelProvider`]: a typed [`Model`] registered by name in a
//!   [`ModelRegistry`], with token owners eager-loaded

mod model;
mod table;

pub use model::{Model, ModelProvider, ModelRegistry, ProviderFactory};
pub use table::{TableColumns, TableProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::config::is_valid_identifier;
use crate::db::{DatabaseTokenStore, Db};
use crate::error::{AuthError, AuthResult};
use crate::hashing::PasswordHasher;
use crate::token::{ProviderToken, TokenStore};
use crate::types::{TokenHash, TokenLookupId, UserIdentifier};

/// Extra equality constraints for credential lookups (e.g. `active = true`).
pub type Constraints = Map<String, Value>;

/// A user record as seen by the auth engine.
///
/// Only the identifier is interpreted; every other column is carried as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: UserIdentifier,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl AuthUser {
    /// Build a user from a raw row, reading the identifier from `primary_key`.
    pub fn from_row(row: Map<String, Value>, primary_key: &str) -> Option<Self> {
        let id = row.get(primary_key).and_then(UserIdentifier::from_value)?;
        Some(Self {
            id,
            attributes: row,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Copy of the user without the given columns, for handing to clients.
    pub fn without(&self, hidden: &[&str]) -> Self {
        let mut user = self.clone();
        user.attributes.retain(|key, _| !hidden.contains(&key.as_str()));
        user
    }

    /// Deserialize the attributes into a typed record.
    pub fn to_model<M: DeserializeOwned>(&self) -> AuthResult<M> {
        Ok(serde_json::from_value(Value::Object(self.attributes.clone()))?)
    }
}

/// Everything a provider needs from the manager to be constructed.
#[derive(Clone)]
pub struct ProviderParts {
    pub db: Db,
    pub hasher: Arc<dyn PasswordHasher>,
    /// Columns matched against the uid in credential lookups.
    pub uids: Vec<String>,
    pub tokens: Arc<DatabaseTokenStore>,
}

/// Resolves identifiers, credentials and tokens to users.
#[async_trait]
pub trait UserProvider: Send + Sync {
    /// Identifier column embedded in tokens and sessions.
    fn primary_key(&self) -> &str;

    async fn find_by_id(&self, id: &UserIdentifier) -> AuthResult<Option<AuthUser>>;

    /// Look a user up by any of the configured uid columns plus `constraints`.
    async fn find_by_credentials(
        &self,
        uid: &str,
        constraints: &Constraints,
    ) -> AuthResult<Option<AuthUser>>;

    /// Verify a plaintext password against the user's stored hash.
    ///
    /// A user without a password column is never valid.
    async fn validate_credentials(&self, user: &AuthUser, password: &str) -> AuthResult<bool>;

    /// Token storage owned by this provider, if any.
    fn tokens(&self) -> Option<Arc<dyn TokenStore>> {
        None
    }

    /// Resolve a token through the provider's token storage.
    async fn find_by_token(
        &self,
        lookup_id: &TokenLookupId,
        hash: &TokenHash,
    ) -> AuthResult<Option<ProviderToken>> {
        let store = self
            .tokens()
            .ok_or_else(|| AuthError::config("user provider has no token storage"))?;
        store.read(lookup_id, hash).await
    }
}

/// Verify `password` against the hash stored in `field`, off the async runtime.
pub(crate) async fn verify_password(
    hasher: &Arc<dyn PasswordHasher>,
    user: &AuthUser,
    field: &str,
    password: &str,
) -> AuthResult<bool> {
    let Some(hash) = user.get(field).and_then(Value::as_str) else {
        return Ok(false);
    };

    let hasher = hasher.clone();
    let hash = hash.to_string();
    let password = password.to_string();
    tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
        .await
        .map_err(|e| AuthError::Internal(format!("password verification task: {}", e)))?
}

/// Run a lookup and turn the rows into users.
///
/// `query` must select with `OMIT id` so that rows are plain JSON objects.
pub(crate) async fn fetch_users(
    db: &Db,
    query: String,
    bindings: Map<String, Value>,
    primary_key: &str,
) -> AuthResult<Vec<AuthUser>> {
    let mut res = db.query(query).bind(bindings).await?;
    let rows: Vec<Value> = res.take(0)?;

    Ok(rows
        .into_iter()
        .filter_map(|row| match row {
            Value::Object(row) => {
                let user = AuthUser::from_row(row, primary_key);
                if user.is_none() {
                    warn!("User row without a usable `{}` column, skipping", primary_key);
                }
                user
            }
            _ => None,
        })
        .collect())
}

/// Build the `SELECT` for a credential lookup.
///
/// Column names are passed as bindings and resolved with `type::field`, so
/// only the parameter names are spliced into the query text.
pub(crate) fn credentials_query(
    table: &str,
    uids: &[String],
    uid: &str,
    constraints: &Constraints,
) -> AuthResult<(String, Map<String, Value>)> {
    if uids.is_empty() {
        return Err(AuthError::config("no uid columns configured"));
    }

    let mut bindings = Map::new();
    bindings.insert("table".into(), Value::from(table));
    bindings.insert("uid".into(), Value::from(uid));

    let mut uid_clauses = Vec::with_capacity(uids.len());
    for (i, column) in uids.iter().enumerate() {
        bindings.insert(format!("uid_col{}", i), Value::from(column.as_str()));
        uid_clauses.push(format!("type::field($uid_col{}) = $uid", i));
    }

    let mut clauses = vec![format!("({})", uid_clauses.join(" OR "))];
    for (i, (column, value)) in constraints.iter().enumerate() {
        if !is_valid_identifier(column) {
            return Err(AuthError::config(format!(
                "`{}` is not a valid constraint column",
                column
            )));
        }
        bindings.insert(format!("con_col{}", i), Value::from(column.as_str()));
        bindings.insert(format!("con_val{}", i), value.clone());
        clauses.push(format!("type::field($con_col{i}) = $con_val{i}"));
    }

    let query = format!(
        "SELECT * OMIT id FROM type::table($table) WHERE {} LIMIT 1",
        clauses.join(" AND ")
    );
    Ok((query, bindings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_user_from_row() {
        let row = json!({"uid": 7, "email": "a@x.com", "password": "hash"});
        let Value::Object(row) = row else { unreachable!() };

        let user = AuthUser::from_row(row.clone(), "uid").unwrap();
        assert_eq!(user.id, UserIdentifier::new("7"));
        assert_eq!(user.get("email"), Some(&json!("a@x.com")));

        let public = user.without(&["password"]);
        assert!(public.get("password").is_none());
        assert!(public.get("email").is_some());

        assert!(AuthUser::from_row(row, "missing").is_none());
    }

    #[test]
    fn test_auth_user_serializes_flat() {
        let row = json!({"uid": "u-1", "email": "a@x.com"});
        let Value::Object(row) = row else { unreachable!() };
        let user = AuthUser::from_row(row, "uid").unwrap();

        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["id"], "u-1");
        assert_eq!(json["email"], "a@x.com");
    }

    #[test]
    fn test_credentials_query() {
        let mut constraints = Constraints::new();
        constraints.insert("active".into(), json!(true));

        let (query, bindings) = credentials_query(
            "users",
            &["email".to_string(), "username".to_string()],
            "foo@x.com",
            &constraints,
        )
        .unwrap();

        assert!(query.contains("type::field($uid_col0) = $uid OR type::field($uid_col1) = $uid"));
        assert!(query.contains("AND type::field($con_col0) = $con_val0"));
        assert!(query.ends_with("LIMIT 1"));
        assert_eq!(bindings["uid_col1"], "username");
        assert_eq!(bindings["con_val0"], true);
        assert_eq!(bindings["uid"], "foo@x.com");
    }

    #[test]
    fn test_credentials_query_rejects_bad_constraint_column() {
        let mut constraints = Constraints::new();
        constraints.insert("active = true OR 1".into(), json!(1));

        let result = credentials_query("users", &["email".to_string()], "a", &constraints);
        assert!(matches!(result, Err(AuthError::Configuration(_))));
    }
}
