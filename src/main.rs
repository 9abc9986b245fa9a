use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    gallery_service::GallerySettings, signer::GrantSigner, storage_service::StorageService,
    thumbnail_service::ThumbnailSize,
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting gallery gateway with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection + schema ---
    let db = db::connect(&cfg.database_url).await?;
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize object store ---
    let secret = match cfg.signing_secret.clone() {
        Some(secret) => secret,
        None => {
            tracing::warn!(
                "GALLERY_SIGNING_SECRET not set; using a per-process secret, issued grants stop working on restart"
            );
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        }
    };
    let signer = GrantSigner::new(secret, &cfg.public_url, cfg.bucket.clone())?;
    let storage =
        StorageService::open(Arc::new(db), cfg.storage_dir.clone(), &cfg.bucket, signer).await?;

    // --- Build router ---
    let settings = GallerySettings {
        grant_ttl: cfg.grant_ttl,
        max_upload_bytes: cfg.max_upload_bytes,
        cascade_preview_delete: cfg.cascade_preview_delete,
    };
    let state = AppState::new(
        storage,
        settings,
        ThumbnailSize::square(cfg.thumbnail_size),
        cfg.request_timeout,
    );
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(state);

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

    tracing::info!(
        bucket = %cfg.bucket,
        public_url = %cfg.public_url,
        "Gallery gateway listening on http://{}",
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;

    Ok(())
}
