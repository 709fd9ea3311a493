use crate::services::{engine::TransferEngine, scheduler::SweepMonitor};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TransferEngine>,

    /// Catalog pool, queried by readiness checks.
    pub db: Arc<SqlitePool>,

    /// Temporary archive root, written to by readiness checks.
    pub temp_archive_dir: PathBuf,

    /// Last pass of each background sweep.
    pub sweeps: Arc<SweepMonitor>,
}
