use anyhow::{Result, anyhow, bail};
use authkit::config::UserSource;
use authkit::{
    AuthSettings, Constraints, DatabaseConfig, MemoryContext, ModelRegistry, SchemeName,
    TokenOptions, create_manager, resolve_config_path, spawn_sweeper,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "authkit")]
#[command(about = "Pluggable authentication schemes over SurrealDB")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Auth configuration file (default: AUTH_CONFIG, then XDG config, then ./auth.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, env = "AUTHKIT_DB_URL", default_value = "memory")]
    db_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the demo HTTP server (login, me, logout)
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
        /// Seconds between expired token sweeps
        #[arg(long, default_value = "300")]
        sweep_interval: u64,
    },
    /// Validate the configuration and list the schemes it defines
    CheckConfig,
    /// Insert a user into a table-backed scheme's table
    CreateUser {
        /// Scheme whose table receives the user (default: the default scheme)
        #[arg(long)]
        scheme: Option<String>,
        /// Column values, e.g. --set email=foo@example.com
        #[arg(long = "set", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
        #[arg(long, env = "AUTHKIT_PASSWORD")]
        password: String,
    },
    /// Validate credentials and issue a token
    IssueToken {
        #[arg(long)]
        scheme: String,
        #[arg(long)]
        uid: String,
        #[arg(long, env = "AUTHKIT_PASSWORD")]
        password: String,
        /// Token label
        #[arg(long)]
        name: Option<String>,
        /// Lifetime in seconds, overriding the scheme's configuration
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// Delete expired tokens from every token table
    SweepTokens,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", raw))
}

fn load_settings(path: Option<PathBuf>) -> Result<AuthSettings> {
    let path = match path {
        Some(path) => path,
        None => resolve_config_path()?,
    };
    info!("Loading auth configuration from {}", path.display());
    Ok(AuthSettings::load(&path)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("authkit=info".parse()?))
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.global.config)?;
    let db_config = DatabaseConfig {
        url: cli.global.db_url,
        ..Default::default()
    };
    let manager = create_manager(settings, db_config, ModelRegistry::new()).await?;

    match cli.command {
        Commands::Serve {
            bind,
            sweep_interval,
        } => {
            for store in manager.token_stores() {
                info!("Sweeping {} every {}s", store.table(), sweep_interval);
                spawn_sweeper(store, Duration::from_secs(sweep_interval));
            }
            authkit::server::run_server(manager, &bind).await?;
        }
        Commands::CheckConfig => {
            println!("Default scheme: {}", manager.default_scheme());
            if !manager.fallback().is_empty() {
                let order: Vec<&str> = manager.fallback().iter().map(SchemeName::as_str).collect();
                println!("Fallback order: {}", order.join(" -> "));
            }
            println!();
            println!("{:<16} {:<10} {:<24} {:<16}", "SCHEME", "KIND", "USERS", "TOKENS");
            println!("{}", "-".repeat(66));

            for name in manager.scheme_names() {
                let config = manager.config(name.as_str())?;
                let users = match &config.source {
                    UserSource::Table(table) => format!("table {}", table),
                    UserSource::Model(model) => format!("model {}", model),
                };
                println!(
                    "{:<16} {:<10} {:<24} {:<16}",
                    name.as_str(),
                    config.kind.as_str(),
                    users,
                    config.token_table
                );
            }
        }
        Commands::CreateUser {
            scheme,
            fields,
            password,
        } => {
            let name = scheme.unwrap_or_else(|| manager.default_scheme().to_string());
            let config = manager.config(&name)?;
            let UserSource::Table(table) = &config.source else {
                bail!("scheme `{}` does not use a table serializer", name);
            };

            let mut row: Map<String, Value> = fields
                .into_iter()
                .map(|(key, value)| (key, Value::from(value)))
                .collect();
            if row.contains_key(&config.password_field) {
                bail!("pass the password with --password, not --set");
            }
            row.entry(config.primary_key.clone())
                .or_insert_with(|| Value::from(uuid::Uuid::new_v4().to_string()));

            let hasher = manager.hasher();
            let hash = tokio::task::spawn_blocking(move || hasher.hash(&password)).await??;
            row.insert(config.password_field.clone(), Value::from(hash));

            manager
                .db()
                .query("CREATE type::table($table) CONTENT $row")
                .bind(("table", table.clone()))
                .bind(("row", Value::Object(row.clone())))
                .await?
                .check()?;

            println!("User created in `{}`", table);
            println!("  {}: {}", config.primary_key, row[&config.primary_key]);
            for uid in &config.uids {
                if let Some(value) = row.get(uid) {
                    println!("  {}: {}", uid, value);
                }
            }
        }
        Commands::IssueToken {
            scheme,
            uid,
            password,
            name,
            expires_in,
        } => {
            let mut auth = manager.auth(Arc::new(MemoryContext::new()));
            let issuer = auth
                .use_scheme(Some(&scheme))?
                .as_token_issuer()
                .ok_or_else(|| anyhow!("scheme `{}` does not issue tokens", scheme))?;

            let mut options = name.map(TokenOptions::named).unwrap_or_default();
            if let Some(seconds) = expires_in {
                let lifetime = chrono::Duration::try_seconds(seconds)
                    .ok_or_else(|| anyhow!("--expires-in {} is out of range", seconds))?;
                options = options.expires_in(lifetime);
            }

            let issued = issuer
                .attempt(&uid, &password, &Constraints::new(), options)
                .await?;

            println!("Token issued by scheme `{}`", scheme);
            println!();
            println!("  Token:   {}", issued.token);
            match issued.expires_at {
                Some(exp) => println!("  Expires: {}", exp.format("%Y-%m-%d %H:%M:%S UTC")),
                None => println!("  Expires: Never"),
            }
            println!();
            println!("IMPORTANT: Save this token now. It cannot be retrieved later.");
            println!("Use with: -H 'Authorization: Bearer {}'", issued.token);
        }
        Commands::SweepTokens => {
            let mut total = 0;
            for store in manager.token_stores() {
                match store.sweep_expired().await {
                    Ok(removed) => {
                        println!("{}: removed {} expired tokens", store.table(), removed);
                        total += removed;
                    }
                    Err(e) => warn!("Sweeping {} failed: {}", store.table(), e),
                }
            }
            println!("Removed {} expired tokens in total", total);
        }
    }

    Ok(())
}
