//! The transfer orchestration engine: shared collaborators, settings and the
//! submission-facing error type. Sweeps and submissions are implemented in their own
//! modules as `impl TransferEngine` blocks.

use crate::models::data_object::{DataObjectRecord, TransferType, UploadStatus, UploadTransition};
use crate::services::{
    backend::{BackendError, TransferClient},
    catalog::{Catalog, CatalogError},
    events::{DomainEvent, EventEmitter},
    locks::PathLocks,
    sweep::Outcome,
    traversal::TraversalError,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// Submission-time rejections. These propagate to the caller; sweep failures never do.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("`{0}` is a link")]
    IsLink(String),
    #[error("`{0}` is not archived")]
    FileNotArchived(String),
    #[error("operation not supported for `{0}`")]
    NotSupported(String),
    #[error("archive object of `{path}` is not located under collection `{collection}`")]
    InvalidArchiveLayout { path: String, collection: String },
    #[error("no data objects found under `{0}`")]
    NoDataObjects(String),
    #[error(transparent)]
    Traversal(#[from] TraversalError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ServiceError {
    /// Stable reject-reason code reported to callers.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_)
            | Self::IsLink(_)
            | Self::InvalidArchiveLayout { .. }
            | Self::NoDataObjects(_) => "INVALID_REQUEST_INPUT",
            Self::NotFound(_) | Self::Traversal(TraversalError::RootNotFound(_)) => "INVALID_PATH",
            Self::Traversal(TraversalError::DepthExceeded { .. }) => "INVALID_REQUEST_INPUT",
            Self::FileNotArchived(_) => "FILE_NOT_ARCHIVED",
            Self::NotSupported(_) | Self::Backend(BackendError::OperationNotSupported(_)) => {
                "API_NOT_SUPPORTED"
            }
            Self::Catalog(_) | Self::Traversal(TraversalError::Catalog(_)) => {
                "DATA_MANAGEMENT_ERROR"
            }
            Self::Backend(_) => "DATA_TRANSFER_ERROR",
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Knobs the engine consumes.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// In-flight uploads older than this are forced to UNKNOWN when their status
    /// cannot be read.
    pub upload_timeout: Duration,
    pub max_concurrent_items: usize,
    pub max_traversal_depth: usize,
    /// Backend receiving the second hop of staged uploads.
    pub permanent_archive: TransferType,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            upload_timeout: Duration::hours(24),
            max_concurrent_items: 8,
            max_traversal_depth: 64,
            permanent_archive: TransferType::Posix,
        }
    }
}

pub struct TransferEngine {
    pub(crate) catalog: Arc<dyn Catalog>,
    pub(crate) transfers: Arc<TransferClient>,
    pub(crate) events: Arc<dyn EventEmitter>,
    pub(crate) locks: PathLocks,
    pub(crate) settings: EngineSettings,
}

impl TransferEngine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        transfers: Arc<TransferClient>,
        events: Arc<dyn EventEmitter>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            catalog,
            transfers,
            events,
            locks: PathLocks::new(),
            settings,
        }
    }

    /// Record an event. The state change it describes is already persisted, so a
    /// failure here is logged and not propagated.
    pub(crate) async fn emit(&self, event: DomainEvent) {
        let kind = event.kind();
        let path = event.path().to_string();
        if let Err(err) = self.events.emit(event).await {
            error!("failed to record {} event for {}: {}", kind, path, err);
        }
    }

    pub(crate) fn upload_timed_out(&self, record: &DataObjectRecord) -> bool {
        Utc::now() - record.created_at > self.settings.upload_timeout
    }

    /// Fallback after an upload's status could not be advanced: force UNKNOWN once the
    /// record is older than the upload timeout, otherwise leave it for the next pass.
    pub(crate) async fn demote_if_timed_out(
        &self,
        record: &DataObjectRecord,
        cause: &str,
    ) -> Outcome {
        if !self.upload_timed_out(record) {
            warn!(
                "upload of {} not advanced ({}); retrying next pass",
                record.path, cause
            );
            return Outcome::Failed(cause.to_string());
        }

        match self
            .catalog
            .transition_upload_status(
                &record.path,
                record.upload_status,
                UploadStatus::Unknown,
                &UploadTransition::default(),
            )
            .await
        {
            Ok(true) => {
                error!(
                    "upload of {} stuck in {} since {} ({}); status forced to UNKNOWN",
                    record.path, record.upload_status, record.created_at, cause
                );
                Outcome::Transitioned
            }
            Ok(false) => Outcome::Unchanged,
            Err(err) => {
                error!("failed to demote {} to UNKNOWN: {}", record.path, err);
                Outcome::Failed(err.to_string())
            }
        }
    }
}
