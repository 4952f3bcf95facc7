use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use tracing::debug;

use crate::config::is_valid_identifier;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("AUTHKIT_DB_URL").unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("AUTHKIT_DB_NAMESPACE").unwrap_or_else(|_| "authkit".to_string()),
            database: env::var("AUTHKIT_DB_DATABASE").unwrap_or_else(|_| "auth".to_string()),
            username: env::var("AUTHKIT_DB_USERNAME").ok(),
            password: env::var("AUTHKIT_DB_PASSWORD").ok(),
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

/// Tables the configured schemes read from and write to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaTables {
    /// `(table, primary key column)` pairs for user tables.
    pub users: Vec<(String, String)>,
    /// Token tables.
    pub tokens: Vec<String>,
}

/// Define user and token tables with their lookup indexes.
///
/// Safe to run repeatedly. Table names cannot be bound as query parameters
/// in DEFINE statements, so every name is checked to be a plain identifier.
pub async fn ensure_schema(db: &Db, tables: &SchemaTables) -> Result<()> {
    let mut statements = Vec::new();

    for (table, primary_key) in &tables.users {
        ensure_identifiers(&[table, primary_key])?;
        statements.push(format!(
            "DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS {table}_{primary_key} ON TABLE {table} COLUMNS {primary_key} UNIQUE;"
        ));
    }

    for table in &tables.tokens {
        ensure_identifiers(&[table])?;
        statements.push(format!(
            "DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS {table}_user_id ON TABLE {table} COLUMNS user_id;
             DEFINE INDEX IF NOT EXISTS {table}_expires_at ON TABLE {table} COLUMNS expires_at;"
        ));
    }

    for statement in statements {
        debug!("Applying schema statement: {}", statement);
        db.query(statement).await?.check()?;
    }

    Ok(())
}

fn ensure_identifiers(names: &[&String]) -> Result<()> {
    match names.iter().find(|name| !is_valid_identifier(name)) {
        Some(bad) => Err(anyhow::anyhow!("`{}` is not a valid table or column name", bad)),
        None => Ok(()),
    }
}
