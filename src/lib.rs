// Core modules
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod hashing;
pub mod token;
pub mod types;

// Schemes and the layers around them
pub mod auth;
pub mod context;
pub mod fallback;
pub mod manager;
pub mod provider;
pub mod scheme;

// HTTP surface
pub mod http;
pub mod server;

#[cfg(test)]
mod test_utils;

// Re-export key types and functions
pub use auth::Auth;
pub use config::{AuthSettings, ResolvedScheme, SchemeKind, SchemeOptions, resolve_config_path};
pub use context::{MemoryContext, RequestContext, SessionHandle};
pub use db::{DatabaseConfig, DatabaseTokenStore, Db, create_connection, spawn_sweeper};
pub use error::{AuthError, AuthResult};
pub use hashing::{Argon2Hasher, Argon2Params, PasswordHasher};
pub use http::{CurrentUser, HttpRequestContext, RequireAuth, require_auth};
pub use manager::{AuthManager, AuthManagerBuilder, ensure_schema};
pub use provider::{AuthUser, Constraints, Model, ModelRegistry, UserProvider};
pub use scheme::{ApiScheme, BasicScheme, JwtScheme, Scheme, SessionScheme, TokenIssuer};
pub use token::{IssuedToken, ProviderToken, TokenOptions, TokenStore};
pub use types::{SchemeName, TokenHash, TokenLookupId, UserIdentifier};

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Connect to the database, build the manager and define its tables.
///
/// Models referenced by a `model` serializer must be registered in `models`.
pub async fn create_manager(
    settings: AuthSettings,
    db_config: DatabaseConfig,
    models: ModelRegistry,
) -> Result<Arc<AuthManager>> {
    info!("Using database url: {}", db_config.url);
    let db = create_connection(db_config).await?;

    let manager = AuthManager::builder(settings)
        .database(db.clone())
        .models(models)
        .build()?;
    ensure_schema(&db, &manager).await?;

    Ok(Arc::new(manager))
}
