use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Bearer token required by the protected endpoints; `None` disables
    /// the auth check entirely.
    pub auth_token: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked-upload file store")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where part payloads are stored (overrides UPLOAD_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLOAD_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bearer token for protected endpoints (overrides UPLOAD_STORE_AUTH_TOKEN)
    #[arg(long)]
    pub auth_token: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into an AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("UPLOAD_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("UPLOAD_STORE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing UPLOAD_STORE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 8080,
            Err(err) => return Err(err).context("reading UPLOAD_STORE_PORT"),
        };
        let env_storage =
            env::var("UPLOAD_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/parts".into());
        let env_db = env::var("UPLOAD_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/upload_store.db".into());
        let env_token = env::var("UPLOAD_STORE_AUTH_TOKEN").ok();

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            auth_token: args.auth_token.or(env_token),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
