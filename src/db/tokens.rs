//! SurrealDB-backed token store.
//!
//! Row shape: record id = lookup id, plus `user_id`, `name`, `token` (hash),
//! `type`, `expires_at`, `created_at`. Any other column is surfaced as token
//! metadata.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use surrealdb::sql::Datetime;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::crypto::hashes_match;
use crate::db::Db;
use crate::error::{AuthError, AuthResult};
use crate::token::{ProviderToken, TokenStore};
use crate::types::{TokenHash, TokenLookupId, UserIdentifier};

/// Columns with a fixed meaning; everything else is metadata.
pub const RESERVED_COLUMNS: &[&str] = &[
    "id",
    "user_id",
    "name",
    "token",
    "type",
    "expires_at",
    "created_at",
];

/// Token store persisting hashed tokens in a SurrealDB table.
#[derive(Clone)]
pub struct DatabaseTokenStore {
    db: Db,
    table: String,
}

impl DatabaseTokenStore {
    /// Create a store over `table`. The name must already be validated.
    pub fn new(db: Db, table: impl Into<String>) -> Self {
        Self {
            db,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Delete every token whose expiry is not later than now.
    ///
    /// Reads never delete expired rows; this is the only place they go away.
    pub async fn sweep_expired(&self) -> AuthResult<usize> {
        let deleted = self
            .delete_counted(
                "WHERE expires_at != NONE AND expires_at <= time::now()",
                None,
            )
            .await?;
        if deleted > 0 {
            info!("Swept {} expired tokens from {}", deleted, self.table);
        }
        Ok(deleted)
    }

    /// Delete every token of `token_type` owned by `owner`.
    pub async fn destroy_for_owner(
        &self,
        owner: &UserIdentifier,
        token_type: &str,
    ) -> AuthResult<usize> {
        self.delete_counted(
            "WHERE user_id = $user_id AND type = $type",
            Some((owner.as_str(), token_type)),
        )
        .await
    }

    /// Run a DELETE with `condition` and count the removed rows.
    ///
    /// The rows are counted in the query; deleted rows carry record ids,
    /// which do not deserialize into JSON.
    async fn delete_counted(
        &self,
        condition: &str,
        owner: Option<(&str, &str)>,
    ) -> AuthResult<usize> {
        let sql = format!(
            "LET $deleted = (DELETE type::table($table) {} RETURN BEFORE);
             RETURN array::len($deleted);",
            condition
        );
        let mut query = self.db.query(sql).bind(("table", self.table.clone()));
        if let Some((user_id, token_type)) = owner {
            query = query
                .bind(("user_id", user_id.to_string()))
                .bind(("type", token_type.to_string()));
        }

        let mut res = query.await?.check()?;
        let deleted: Option<usize> = res.take(1)?;
        Ok(deleted.unwrap_or(0))
    }
}

#[async_trait]
impl TokenStore for DatabaseTokenStore {
    #[instrument(skip(self, supplied_hash), fields(table = %self.table))]
    async fn read(
        &self,
        lookup_id: &TokenLookupId,
        supplied_hash: &TokenHash,
    ) -> AuthResult<Option<ProviderToken>> {
        let mut res = self
            .db
            .query("SELECT * OMIT id FROM type::thing($table, $lookup_id)")
            .bind(("table", self.table.clone()))
            .bind(("lookup_id", lookup_id.as_str().to_string()))
            .await?;

        let rows: Vec<Value> = res.take(0)?;
        let Some(Value::Object(row)) = rows.into_iter().next() else {
            debug!("No token row for lookup id");
            return Ok(None);
        };

        let Some(stored_hash) = row.get("token").and_then(Value::as_str) else {
            warn!("Token row without a hash column, ignoring");
            return Ok(None);
        };
        if !hashes_match(&TokenHash::new(stored_hash), supplied_hash) {
            debug!("Token hash mismatch");
            return Ok(None);
        }

        let token = match token_from_row(lookup_id, row) {
            Ok(token) => token,
            Err(e) => {
                warn!("Malformed token row: {}", e);
                return Ok(None);
            }
        };

        if token.is_expired() {
            debug!("Token expired at {:?}", token.expires_at);
            return Ok(None);
        }

        Ok(Some(token))
    }

    #[instrument(skip(self, token), fields(table = %self.table))]
    async fn write(&self, token: &ProviderToken) -> AuthResult<TokenLookupId> {
        let lookup_id = token
            .lookup_id
            .clone()
            .unwrap_or_else(|| TokenLookupId::new(Uuid::new_v4().simple().to_string()));

        let mut content: Map<String, Value> = token
            .meta
            .iter()
            .filter(|(key, _)| !RESERVED_COLUMNS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        content.insert("user_id".into(), Value::from(token.owner_id.as_str()));
        content.insert("name".into(), Value::from(token.name.as_str()));
        content.insert("token".into(), Value::from(token.token_hash.as_str()));
        content.insert("type".into(), Value::from(token.token_type.as_str()));

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                CREATE type::thing($table, $lookup_id) CONTENT $content RETURN NONE;
                UPDATE type::thing($table, $lookup_id) SET
                    expires_at = $expires_at,
                    created_at = time::now()
                RETURN NONE;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("table", self.table.clone()))
            .bind(("lookup_id", lookup_id.as_str().to_string()))
            .bind(("content", Value::Object(content)))
            .bind(("expires_at", token.expires_at.map(Datetime::from)))
            .await?
            .check()?;

        debug!("Persisted token for owner {}", token.owner_id);
        Ok(lookup_id)
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn destroy(&self, lookup_id: &TokenLookupId) -> AuthResult<()> {
        self.db
            .query("DELETE type::thing($table, $lookup_id)")
            .bind(("table", self.table.clone()))
            .bind(("lookup_id", lookup_id.as_str().to_string()))
            .await?
            .check()?;
        Ok(())
    }
}

fn token_from_row(lookup_id: &TokenLookupId, mut row: Map<String, Value>) -> AuthResult<ProviderToken> {
    let owner_id = row
        .get("user_id")
        .and_then(UserIdentifier::from_value)
        .ok_or_else(|| AuthError::invalid_token("token row has no owner"))?;

    let expires_at = match row.get("expires_at") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            parse_timestamp(value)
                .ok_or_else(|| AuthError::invalid_token("unreadable expires_at"))?,
        ),
    };
    let created_at = row.get("created_at").and_then(parse_timestamp);

    let text = |row: &Map<String, Value>, key: &str| {
        row.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
    };
    let name = text(&row, "name");
    let token_type = text(&row, "type");
    let token_hash = TokenHash::new(text(&row, "token"));

    row.retain(|key, _| !RESERVED_COLUMNS.contains(&key.as_str()));

    let mut token = ProviderToken::new(name, token_hash, owner_id, token_type)
        .with_expiry(expires_at)
        .with_meta(row);
    token.created_at = created_at;
    token.lookup_id = Some(lookup_id.clone());
    Ok(token)
}

/// Normalize the store's timestamp representation into a UTC instant.
///
/// Accepts RFC 3339 strings (optionally wrapped as a `d'...'` literal),
/// Unix timestamps in seconds or milliseconds, and single-field wrapper
/// objects around either.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => {
            let raw = raw.trim();
            let raw = raw
                .strip_prefix("d'")
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| raw.strip_prefix("d\"").and_then(|s| s.strip_suffix('"')))
                .unwrap_or(raw);
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        Value::Object(map) if map.len() == 1 => map.values().next().and_then(parse_timestamp),
        _ => None,
    }
}

/// Run `sweep_expired` every `period` until the handle is aborted.
pub fn spawn_sweeper(store: Arc<DatabaseTokenStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = store.sweep_expired().await {
                warn!("Token sweep on {} failed: {}", store.table(), e);
            }
        }
    })
}
