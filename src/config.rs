//! Auth configuration document.
//!
//! ```json
//! {
//!   "authenticator": "session",
//!   "fallback": ["jwt", "api"],
//!   "session": { "scheme": "session", "serializer": "table", "table": "users" },
//!   "jwt": { "scheme": "jwt", "serializer": "model", "model": "User", "secret": "${APP_KEY}" }
//! }
//! ```
//!
//! Every key other than `authenticator` and `fallback` names a scheme.
//! `${VAR}` references in string values are expanded from the environment.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, env, fmt, fs, path::Path, path::PathBuf, str::FromStr};

use crate::error::{AuthError, AuthResult};
use crate::token::MAX_TOKEN_LIFETIME;
use crate::types::SchemeName;

pub const DEFAULT_PRIMARY_KEY: &str = "uid";
pub const DEFAULT_PASSWORD_FIELD: &str = "password";
pub const DEFAULT_UID: &str = "email";
pub const DEFAULT_TOKEN_TABLE: &str = "auth_tokens";
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 3600;

/// Authentication mechanism implemented by a scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeKind {
    Session,
    Basic,
    Jwt,
    Api,
}

impl SchemeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Basic => "basic",
            Self::Jwt => "jwt",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for SchemeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchemeKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "basic" => Ok(Self::Basic),
            "jwt" => Ok(Self::Jwt),
            "api" => Ok(Self::Api),
            other => Err(AuthError::config(format!("unknown scheme kind `{}`", other))),
        }
    }
}

/// How a scheme resolves user records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    /// Generic table access with column names from configuration.
    Table,
    /// Typed model registered in the `ModelRegistry`.
    Model,
}

impl FromStr for SerializerKind {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(Self::Table),
            "model" => Ok(Self::Model),
            other => Err(AuthError::config(format!("unknown serializer `{}`", other))),
        }
    }
}

/// Raw configuration document, as deserialized.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// Default scheme name.
    pub authenticator: String,
    /// Default order for fallback authentication.
    #[serde(default)]
    pub fallback: Vec<String>,
    #[serde(flatten)]
    pub schemes: BTreeMap<String, SchemeSettings>,
}

/// One scheme entry, as written by the user. Everything is optional here so
/// that validation can report exactly which key is missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemeSettings {
    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub serializer: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "identifierKey")]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub uids: Option<Vec<String>>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub tokens: Option<String>,
    #[serde(default)]
    pub options: SchemeOptions,
}

/// Scheme-specific knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemeOptions {
    /// Token lifetime in seconds (jwt: default 3600; api: none unless set).
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Session key holding the user identifier (default `auth_<scheme>`).
    #[serde(default)]
    pub session_key: Option<String>,
    /// Realm advertised in Basic challenges.
    #[serde(default)]
    pub realm: Option<String>,
    /// JWT `iss` claim to emit and require.
    #[serde(default)]
    pub issuer: Option<String>,
    /// JWT `aud` claim to emit and require.
    #[serde(default)]
    pub audience: Option<String>,
    /// `type` column written for api tokens (default `api_token`).
    #[serde(default)]
    pub token_type: Option<String>,
}

/// Where a scheme's users come from, after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSource {
    Table(String),
    Model(String),
}

/// A validated scheme entry. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct ResolvedScheme {
    pub name: SchemeName,
    pub kind: SchemeKind,
    pub source: UserSource,
    pub primary_key: String,
    pub uids: Vec<String>,
    pub password_field: String,
    pub secret: Option<String>,
    pub token_table: String,
    pub options: SchemeOptions,
}

impl ResolvedScheme {
    pub fn session_key(&self) -> String {
        self.options
            .session_key
            .clone()
            .unwrap_or_else(|| format!("auth_{}", self.name))
    }

    /// Configured token lifetime, capped at [`MAX_TOKEN_LIFETIME`].
    pub fn expires_in(&self) -> Option<chrono::Duration> {
        let max = MAX_TOKEN_LIFETIME.num_seconds() as u64;
        self.options
            .expires_in
            .map(|seconds| chrono::Duration::seconds(seconds.min(max) as i64))
    }

    pub fn token_type(&self) -> String {
        self.options
            .token_type
            .clone()
            .unwrap_or_else(|| "api_token".to_string())
    }
}

impl AuthSettings {
    /// Parse a JSON document, expanding `${VAR}` references first.
    pub fn from_json_str(raw: &str) -> AuthResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| AuthError::config(format!("invalid auth config: {}", e)))?;
        serde_json::from_value(expand_value(value))
            .map_err(|e| AuthError::config(format!("invalid auth config: {}", e)))
    }

    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> AuthResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            AuthError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Validate every scheme entry and the top-level references.
    pub fn resolve(&self) -> AuthResult<Vec<ResolvedScheme>> {
        let mut resolved = Vec::with_capacity(self.schemes.len());
        for (name, settings) in &self.schemes {
            resolved.push(resolve_scheme(name, settings)?);
        }

        let known = |name: &str| self.schemes.contains_key(name);
        if !known(&self.authenticator) {
            return Err(AuthError::config(format!(
                "default authenticator `{}` is not a configured scheme",
                self.authenticator
            )));
        }
        if let Some(missing) = self.fallback.iter().find(|name| !known(name)) {
            return Err(AuthError::config(format!(
                "fallback scheme `{}` is not configured",
                missing
            )));
        }
        if let Some((i, repeated)) = self
            .fallback
            .iter()
            .enumerate()
            .find(|(i, name)| self.fallback[..*i].contains(*name))
        {
            return Err(AuthError::config(format!(
                "fallback scheme `{}` is listed twice (position {})",
                repeated,
                i + 1
            )));
        }

        Ok(resolved)
    }
}

fn resolve_scheme(name: &str, settings: &SchemeSettings) -> AuthResult<ResolvedScheme> {
    let kind: SchemeKind = settings
        .scheme
        .as_deref()
        .ok_or_else(|| AuthError::config(format!("scheme `{}` is missing `scheme`", name)))?
        .parse()?;

    let serializer: SerializerKind = settings
        .serializer
        .as_deref()
        .ok_or_else(|| AuthError::config(format!("scheme `{}` is missing `serializer`", name)))?
        .parse()?;

    let source = match serializer {
        SerializerKind::Table => {
            let table = settings.table.clone().ok_or_else(|| {
                AuthError::config(format!("scheme `{}` uses the table serializer without `table`", name))
            })?;
            UserSource::Table(ensure_identifier(name, table)?)
        }
        SerializerKind::Model => {
            let model = settings.model.clone().ok_or_else(|| {
                AuthError::config(format!("scheme `{}` uses the model serializer without `model`", name))
            })?;
            UserSource::Model(model)
        }
    };

    let secret = settings.secret.clone().filter(|s| !s.is_empty());
    if kind == SchemeKind::Jwt && secret.is_none() {
        return Err(AuthError::config(format!("jwt scheme `{}` requires a `secret`", name)));
    }

    let uids = settings
        .uids
        .clone()
        .filter(|uids| !uids.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_UID.to_string()]);

    Ok(ResolvedScheme {
        name: SchemeName::new(name),
        kind,
        source,
        primary_key: ensure_identifier(
            name,
            settings.primary_key.clone().unwrap_or_else(|| DEFAULT_PRIMARY_KEY.to_string()),
        )?,
        uids: uids
            .into_iter()
            .map(|uid| ensure_identifier(name, uid))
            .collect::<AuthResult<_>>()?,
        password_field: ensure_identifier(
            name,
            settings.password.clone().unwrap_or_else(|| DEFAULT_PASSWORD_FIELD.to_string()),
        )?,
        secret,
        token_table: ensure_identifier(
            name,
            settings.tokens.clone().unwrap_or_else(|| DEFAULT_TOKEN_TABLE.to_string()),
        )?,
        options: settings.options.clone(),
    })
}

/// Table and column names end up in queries; only plain identifiers are allowed.
pub fn is_valid_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn ensure_identifier(scheme: &str, value: String) -> AuthResult<String> {
    if is_valid_identifier(&value) {
        Ok(value)
    } else {
        Err(AuthError::config(format!(
            "scheme `{}`: `{}` is not a valid table or column name",
            scheme, value
        )))
    }
}

/// Locate the configuration file.
pub fn resolve_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(p) = env::var("AUTH_CONFIG") {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("authkit").join("auth.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("auth.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find auth.json (set AUTH_CONFIG or create ./auth.json)"
    ))
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(expand_env_vars(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(expand_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, expand_value(v)))
                .collect(),
        ),
        other => other,
    }
}
