use anyhow::Result;
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let connect_opts =
        SqliteConnectOptions::from_str(&cfg.database_url)?.create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_opts)
            .await?,
    );

    services::upload_service::apply_migrations(&db).await?;
    tracing::debug!("Database schema up to date");

    // --- Initialize core service + injected auth predicate ---
    let state = routes::routes::AppState {
        service: services::upload_service::UploadService::new(db, cfg.storage_dir.clone()),
        check_auth: auth::bearer_token_auth(cfg.auth_token.clone()),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
