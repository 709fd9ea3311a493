//! Shared fixtures for unit tests: in-memory catalog, scripted backend, recording
//! event emitter and an engine wired from them.

use crate::models::{
    collection::parent_path,
    data_object::{DataObjectRecord, FileLocation, TransferType, UploadStatus},
    tiering::TierSubmission,
};
use crate::services::{
    backend::{
        BackendError, BackendResult, DownloadReport, DownloadRequest, DownloadStarted, StagedFile,
        TransferBackend, TransferClient, UploadReport, UploadRequest, UploadResponse,
    },
    catalog::{SqliteCatalog, run_migrations},
    engine::{EngineSettings, TransferEngine},
    events::{DomainEvent, EventEmitter, EventError},
    tiering_config::{ArchiveConfiguration, TieringConfig},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Single-connection in-memory pool with the schema applied.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    run_migrations(&pool).await.expect("apply schema");
    Arc::new(pool)
}

pub async fn memory_catalog() -> SqliteCatalog {
    SqliteCatalog::new(memory_pool().await)
}

/// A data object record in `status`, archived on S3 under its own path.
pub fn record(path: &str, status: UploadStatus) -> DataObjectRecord {
    let landed = matches!(
        status,
        UploadStatus::Archived | UploadStatus::InTemporaryArchive
    );
    DataObjectRecord {
        path: path.to_string(),
        collection_path: parent_path(path).to_string(),
        upload_status: status,
        archive_location: landed.then(|| FileLocation::new("archive", path)),
        source_location: Some(FileLocation::new("endpoint", format!("/src{}", path))),
        transfer_type: TransferType::S3,
        transfer_request_id: Some(format!("req-{}", path)),
        created_at: Utc::now(),
        completed_at: None,
        registrar_id: "registrar".into(),
        caller_object_id: None,
        doc: "DOC".into(),
        configuration_id: "cfg".into(),
        s3_archive_configuration_id: Some("s3cfg".into()),
        link_source_path: None,
        checksum: None,
        deep_archive_status: None,
        deep_archive_date: None,
    }
}

/// Tiering table allowing `cfg` on S3.
pub fn tierable() -> TieringConfig {
    TieringConfig {
        configurations: vec![
            ArchiveConfiguration {
                configuration_id: "cfg".into(),
                s3_archive_configuration_id: Some("s3cfg".into()),
                transfer_type: TransferType::S3,
                tiering_supported: true,
            },
            ArchiveConfiguration {
                configuration_id: "cfg".into(),
                s3_archive_configuration_id: Some("s3cfg-cold".into()),
                transfer_type: TransferType::S3,
                tiering_supported: false,
            },
        ],
    }
}

#[derive(Default)]
struct FakeState {
    delay: Duration,
    calls: usize,
    upload_reports: HashMap<String, UploadReport>,
    start_upload_status: Option<UploadStatus>,
    fail_uploads: bool,
    staged: HashSet<String>,
    download_reports: HashMap<String, DownloadReport>,
    start_download_report: Option<DownloadReport>,
    failing_download_sources: HashSet<String>,
    upload_requests: Vec<UploadRequest>,
    download_requests: Vec<DownloadRequest>,
    tier_submissions: Vec<TierSubmission>,
    deleted: Vec<FileLocation>,
}

/// Scripted backend. Unknown request ids answer `RequestNotFound`.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().expect("fake backend state");
        f(&mut state)
    }

    async fn enter(&self) {
        let delay = self.with(|s| {
            s.calls += 1;
            s.delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        self.with(|s| s.delay = delay);
    }

    pub fn calls(&self) -> usize {
        self.with(|s| s.calls)
    }

    pub fn set_upload_report(&self, request_id: &str, report: UploadReport) {
        self.with(|s| s.upload_reports.insert(request_id.to_string(), report));
    }

    pub fn set_start_upload_status(&self, status: UploadStatus) {
        self.with(|s| s.start_upload_status = Some(status));
    }

    pub fn fail_uploads(&self) {
        self.with(|s| s.fail_uploads = true);
    }

    pub fn stage(&self, object_id: &str) {
        self.with(|s| s.staged.insert(object_id.to_string()));
    }

    pub fn set_download_report(&self, request_id: &str, report: DownloadReport) {
        self.with(|s| s.download_reports.insert(request_id.to_string(), report));
    }

    pub fn set_start_download_report(&self, report: DownloadReport) {
        self.with(|s| s.start_download_report = Some(report));
    }

    /// Reject `start_download` for this archive object id.
    pub fn fail_download_of(&self, object_id: &str) {
        self.with(|s| s.failing_download_sources.insert(object_id.to_string()));
    }

    pub fn upload_requests(&self) -> Vec<UploadRequest> {
        self.with(|s| s.upload_requests.clone())
    }

    pub fn download_requests(&self) -> Vec<DownloadRequest> {
        self.with(|s| s.download_requests.clone())
    }

    pub fn tier_submissions(&self) -> Vec<TierSubmission> {
        self.with(|s| s.tier_submissions.clone())
    }

    pub fn deleted(&self) -> Vec<FileLocation> {
        self.with(|s| s.deleted.clone())
    }

    /// Request id `start_download` hands out for an archive object id.
    pub fn download_request_id(object_id: &str) -> String {
        format!("dl-{}", object_id)
    }
}

#[async_trait]
impl TransferBackend for FakeBackend {
    async fn start_upload(&self, request: UploadRequest) -> BackendResult<UploadResponse> {
        self.enter().await;
        let (fail, status) = self.with(|s| {
            s.upload_requests.push(request.clone());
            (
                s.fail_uploads,
                s.start_upload_status.unwrap_or(UploadStatus::Archived),
            )
        });
        if fail {
            return Err(BackendError::Rejected("archive unavailable".into()));
        }
        Ok(UploadResponse {
            archive_location: FileLocation::new("permanent", request.path.clone()),
            request_id: format!("up-{}", request.path),
            checksum: Some("d41d8cd98f00b204e9800998ecf8427e".into()),
            status,
        })
    }

    async fn upload_status(&self, request_id: &str, _doc: &str) -> BackendResult<UploadReport> {
        self.enter().await;
        self.with(|s| s.upload_reports.get(request_id).cloned())
            .ok_or_else(|| BackendError::RequestNotFound(request_id.to_string()))
    }

    async fn start_download(&self, request: DownloadRequest) -> BackendResult<DownloadStarted> {
        self.enter().await;
        let object_id = request.archive_location.object_id.clone();
        let (rejected, report) = self.with(|s| {
            s.download_requests.push(request.clone());
            (
                s.failing_download_sources.contains(&object_id),
                s.start_download_report
                    .clone()
                    .unwrap_or_else(DownloadReport::in_progress),
            )
        });
        if rejected {
            return Err(BackendError::Rejected(format!(
                "cannot read {}",
                object_id
            )));
        }
        Ok(DownloadStarted {
            request_id: Self::download_request_id(&object_id),
            report,
        })
    }

    async fn download_status(&self, request_id: &str, _doc: &str) -> BackendResult<DownloadReport> {
        self.enter().await;
        self.with(|s| s.download_reports.get(request_id).cloned())
            .ok_or_else(|| BackendError::RequestNotFound(request_id.to_string()))
    }

    async fn fetch_staged_file(&self, object_id: &str) -> BackendResult<StagedFile> {
        self.enter().await;
        if !self.with(|s| s.staged.contains(object_id)) {
            return Err(BackendError::StagedFileNotFound(object_id.to_string()));
        }
        Ok(StagedFile {
            location: FileLocation::new("temp", object_id),
            path: PathBuf::from(object_id),
            size: 0,
        })
    }

    async fn submit_tier(&self, submission: TierSubmission) -> BackendResult<()> {
        self.enter().await;
        self.with(|s| s.tier_submissions.push(submission));
        Ok(())
    }

    async fn delete_object(&self, location: &FileLocation, _doc: &str) -> BackendResult<()> {
        self.enter().await;
        self.with(|s| {
            s.staged.remove(&location.object_id);
            s.deleted.push(location.clone());
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEmitter {
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().expect("recorded events").clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(DomainEvent::kind).collect()
    }
}

#[async_trait]
impl EventEmitter for RecordingEmitter {
    async fn emit(&self, event: DomainEvent) -> Result<(), EventError> {
        self.events.lock().expect("recorded events").push(event);
        Ok(())
    }
}

/// An engine over an in-memory catalog. `archive` serves S3, GLOBUS and POSIX;
/// `temp` serves the staging area.
pub struct Harness {
    pub engine: TransferEngine,
    pub catalog: Arc<SqliteCatalog>,
    pub archive: Arc<FakeBackend>,
    pub temp: Arc<FakeBackend>,
    pub events: Arc<RecordingEmitter>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_tiering(tierable()).await
    }

    pub async fn with_tiering(tiering: TieringConfig) -> Self {
        Self::build(tiering, EngineSettings::default()).await
    }

    pub async fn with_settings(settings: EngineSettings) -> Self {
        Self::build(tierable(), settings).await
    }

    async fn build(tiering: TieringConfig, settings: EngineSettings) -> Self {
        let catalog = Arc::new(memory_catalog().await);
        let archive = Arc::new(FakeBackend::default());
        let temp = Arc::new(FakeBackend::default());
        let events = Arc::new(RecordingEmitter::default());

        let transfers = TransferClient::new(Arc::new(tiering), Duration::from_secs(5))
            .with_backend(TransferType::S3, archive.clone())
            .with_backend(TransferType::Globus, archive.clone())
            .with_backend(TransferType::Posix, archive.clone())
            .with_backend(TransferType::Temp, temp.clone());

        let engine = TransferEngine::new(
            catalog.clone(),
            Arc::new(transfers),
            events.clone(),
            settings,
        );

        Self {
            engine,
            catalog,
            archive,
            temp,
            events,
        }
    }

    /// Create collections (parents first) and data objects in one go.
    pub async fn seed(&self, collections: &[&str], objects: &[DataObjectRecord]) {
        use crate::services::catalog::Catalog;

        for path in collections {
            self.catalog
                .insert_collection(path, Some("cfg"))
                .await
                .expect("seed collection");
        }
        for object in objects {
            self.catalog
                .insert_data_object(object)
                .await
                .expect("seed data object");
        }
    }
}
