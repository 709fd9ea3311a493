use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::models::data_object::TransferType;
use crate::services::{
    backend::TransferClient,
    catalog::{self, SqliteCatalog},
    engine::TransferEngine,
    events::SqliteEventLog,
    posix_archive::PosixArchive,
    scheduler,
    tiering_config::TieringConfig,
};

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod testing;

fn ensure_dir(dir: &str) -> Result<()> {
    if !Path::new(dir).exists() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir))?;
        tracing::info!("Created directory at {}", dir);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting transfer-orchestrator with config: {:?}", cfg);

    // --- Ensure archive directories exist ---
    ensure_dir(&cfg.temp_archive_dir)?;
    ensure_dir(&cfg.posix_archive_dir)?;
    ensure_dir(&cfg.download_dir)?;

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx refuses to open a missing file without create_if_missing
    if let Err(e) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(db_path)
    {
        tracing::warn!("Failed to open catalog file manually: {}", e);
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Handle migration mode ---
    if migrate {
        catalog::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Backends ---
    let tiering = match &cfg.tiering_config {
        Some(path) => TieringConfig::load(path)
            .with_context(|| format!("loading tiering configuration {}", path))?,
        None => {
            tracing::warn!("No tiering configuration given; nothing will be tierable");
            TieringConfig::default()
        }
    };

    let transfers = TransferClient::new(Arc::new(tiering), cfg.call_timeout())
        .with_backend(
            TransferType::Temp,
            Arc::new(PosixArchive::new(
                TransferType::Temp,
                &cfg.temp_archive_dir,
                &cfg.download_dir,
            )),
        )
        .with_backend(
            TransferType::Posix,
            Arc::new(PosixArchive::new(
                TransferType::Posix,
                &cfg.posix_archive_dir,
                &cfg.download_dir,
            )),
        );
    config::ensure_permanent_archive(cfg.permanent_archive, &transfers)
        .context("checking the permanent archive")?;

    // --- Initialize core engine ---
    let engine = Arc::new(TransferEngine::new(
        Arc::new(SqliteCatalog::new(db.clone())),
        Arc::new(transfers),
        Arc::new(SqliteEventLog::new(db.clone())),
        cfg.engine_settings(),
    ));

    let sweeps = Arc::new(scheduler::SweepMonitor::new(cfg.sweep_interval()));
    let handles = scheduler::spawn_sweeps(
        Arc::clone(&engine),
        cfg.sweep_interval(),
        Arc::clone(&sweeps),
    );
    tracing::info!(
        "Started {} sweeps every {:?}",
        handles.len(),
        cfg.sweep_interval()
    );

    let state = state::AppState {
        engine,
        db,
        temp_archive_dir: cfg.temp_archive_dir.clone().into(),
        sweeps,
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
