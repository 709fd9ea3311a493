//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> catalog backlog, staging-area I/O and sweep liveness

use crate::{
    models::download::CollectionDownloadStatus,
    services::scheduler::SweepHealth,
    state::AppState,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::HashMap, path::Path};
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Always 200; performs no I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// Work waiting on the sweeps.
#[derive(Serialize, Debug, Default, PartialEq, Eq)]
struct Backlog {
    active_downloads: i64,
    canceled_downloads: i64,
    received_collection_downloads: i64,
    in_progress_collection_downloads: i64,
}

async fn backlog(db: &SqlitePool) -> Result<Backlog, sqlx::Error> {
    let (active_downloads, canceled_downloads): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(cancel_requested), 0) FROM data_object_download_tasks",
    )
    .fetch_one(db)
    .await?;

    let by_status: Vec<(CollectionDownloadStatus, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM collection_download_tasks
         WHERE status IN (?, ?) GROUP BY status",
    )
    .bind(CollectionDownloadStatus::Received)
    .bind(CollectionDownloadStatus::InProgress)
    .fetch_all(db)
    .await?;
    let count = |status: CollectionDownloadStatus| {
        by_status
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n)
    };

    Ok(Backlog {
        active_downloads,
        canceled_downloads,
        received_collection_downloads: count(CollectionDownloadStatus::Received),
        in_progress_collection_downloads: count(CollectionDownloadStatus::InProgress),
    })
}

/// Write, read back and remove a marker file where staged uploads land.
async fn check_staging_dir(dir: &Path) -> Result<(), String> {
    let marker = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&marker, b"readyz")
        .await
        .map_err(|e| format!("could not write marker: {}", e))?;
    let read = fs::read(&marker).await;
    let removed = fs::remove_file(&marker).await;
    match read {
        Ok(bytes) if bytes == b"readyz" => {}
        Ok(_) => return Err("marker content mismatch".into()),
        Err(e) => return Err(format!("could not read marker: {}", e)),
    }
    removed.map_err(|e| format!("could not remove marker: {}", e))
}

fn check<T>(result: &Result<T, impl ToString>) -> CheckStatus {
    CheckStatus {
        ok: result.is_ok(),
        error: result.as_ref().err().map(ToString::to_string),
    }
}

/// `GET /readyz`
///
/// 200 when the catalog answers, the temporary archive is writable and no sweep
/// has gone silent; 503 otherwise. The body carries the sweep backlog and each
/// sweep's last pass either way.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let backlog = backlog(&state.db).await;
    let staging = check_staging_dir(&state.temp_archive_dir).await;
    let sweeps = state.sweeps.snapshot();
    let stalled: Vec<&str> = sweeps.iter().filter(|s| s.stalled).map(|s| s.name).collect();

    let mut checks = HashMap::new();
    checks.insert("catalog", check(&backlog));
    checks.insert("temp_archive", check(&staging));
    checks.insert(
        "sweeps",
        CheckStatus {
            ok: stalled.is_empty(),
            error: (!stalled.is_empty()).then(|| format!("stalled: {}", stalled.join(", "))),
        },
    );

    let ready = checks.values().all(|c| c.ok);
    let body = ReadyResponse {
        status: if ready { "ok" } else { "error" }.into(),
        checks,
        backlog: backlog.ok(),
        sweeps,
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
    backlog: Option<Backlog>,
    sweeps: Vec<SweepHealth>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
