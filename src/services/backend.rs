//! Backend transfer capability contract and the dispatcher the engine talks to.
//!
//! Each archive backend (temporary staging area, POSIX archive, S3, Globus) implements
//! [`TransferBackend`]. The engine never holds a backend directly; it goes through
//! [`TransferClient`], which picks the backend by [`TransferType`], bounds every call
//! with a timeout and answers tiering capability questions from the static
//! [`TieringConfig`] table.

use crate::models::data_object::{FileLocation, TransferType, UploadStatus};
use crate::models::tiering::TierSubmission;
use crate::services::tiering_config::TieringConfig;
use async_trait::async_trait;
use std::{collections::HashMap, future::Future, io, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no backend registered for transfer type {0}")]
    Unsupported(TransferType),
    #[error("operation not supported by the {0} backend")]
    OperationNotSupported(TransferType),
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("staged file `{0}` not found")]
    StagedFileNotFound(String),
    #[error("transfer request `{0}` not found")]
    RequestNotFound(String),
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// What the backend reports for a download request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadStatus {
    InProgress,
    Completed,
    Failed,
}

/// Full download status report, including the backend's failure message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadReport {
    pub status: DownloadStatus,
    pub message: Option<String>,
}

impl DownloadReport {
    pub fn completed() -> Self {
        Self {
            status: DownloadStatus::Completed,
            message: None,
        }
    }

    pub fn in_progress() -> Self {
        Self {
            status: DownloadStatus::InProgress,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: DownloadStatus::Failed,
            message: Some(message.into()),
        }
    }
}

/// Upload status report. Carries the archive coordinates once the bytes have landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadReport {
    pub status: UploadStatus,
    pub archive_location: Option<FileLocation>,
}

impl UploadReport {
    pub fn new(status: UploadStatus) -> Self {
        Self {
            status,
            archive_location: None,
        }
    }

    pub fn landed(status: UploadStatus, archive_location: FileLocation) -> Self {
        Self {
            status,
            archive_location: Some(archive_location),
        }
    }
}

/// Where upload bytes come from.
#[derive(Clone, Debug)]
pub enum UploadSource {
    /// A local file, e.g. one staged in the temporary archive.
    File(PathBuf),
    /// A location on a remote endpoint the backend pulls from.
    Remote(FileLocation),
}

#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub source: UploadSource,
    /// Logical path of the data object; backends derive the object id from it.
    pub path: String,
    pub registrar_id: String,
    pub caller_object_id: Option<String>,
    pub doc: String,
}

#[derive(Clone, Debug)]
pub struct UploadResponse {
    pub archive_location: FileLocation,
    pub request_id: String,
    pub checksum: Option<String>,
    pub status: UploadStatus,
}

#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub archive_location: FileLocation,
    pub destination: FileLocation,
    pub doc: String,
}

#[derive(Clone, Debug)]
pub struct DownloadStarted {
    pub request_id: String,
    pub report: DownloadReport,
}

/// A file handle on a staged object.
#[derive(Clone, Debug)]
pub struct StagedFile {
    pub location: FileLocation,
    pub path: PathBuf,
    pub size: u64,
}

/// Uniform operations against one archive backend.
#[async_trait]
pub trait TransferBackend: Send + Sync {
    async fn start_upload(&self, request: UploadRequest) -> BackendResult<UploadResponse>;

    async fn upload_status(&self, request_id: &str, doc: &str) -> BackendResult<UploadReport>;

    async fn start_download(&self, request: DownloadRequest) -> BackendResult<DownloadStarted>;

    async fn download_status(&self, request_id: &str, doc: &str)
    -> BackendResult<DownloadReport>;

    async fn fetch_staged_file(&self, object_id: &str) -> BackendResult<StagedFile>;

    async fn submit_tier(&self, submission: TierSubmission) -> BackendResult<()>;

    async fn delete_object(&self, location: &FileLocation, doc: &str) -> BackendResult<()>;
}

/// Dispatches calls to the backend registered for a transfer type.
#[derive(Clone)]
pub struct TransferClient {
    backends: HashMap<TransferType, Arc<dyn TransferBackend>>,
    tiering: Arc<TieringConfig>,
    call_timeout: Duration,
}

impl TransferClient {
    pub fn new(tiering: Arc<TieringConfig>, call_timeout: Duration) -> Self {
        Self {
            backends: HashMap::new(),
            tiering,
            call_timeout,
        }
    }

    pub fn with_backend(mut self, kind: TransferType, backend: Arc<dyn TransferBackend>) -> Self {
        self.backends.insert(kind, backend);
        self
    }

    pub fn has_backend(&self, kind: TransferType) -> bool {
        self.backends.contains_key(&kind)
    }

    pub fn tiering(&self) -> &TieringConfig {
        &self.tiering
    }

    fn backend(&self, kind: TransferType) -> BackendResult<&Arc<dyn TransferBackend>> {
        self.backends
            .get(&kind)
            .ok_or(BackendError::Unsupported(kind))
    }

    async fn bounded<T, F>(&self, call: F) -> BackendResult<T>
    where
        F: Future<Output = BackendResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.call_timeout)),
        }
    }

    pub async fn start_upload(
        &self,
        kind: TransferType,
        request: UploadRequest,
    ) -> BackendResult<UploadResponse> {
        let backend = self.backend(kind)?;
        self.bounded(backend.start_upload(request)).await
    }

    pub async fn upload_status(
        &self,
        kind: TransferType,
        request_id: &str,
        doc: &str,
    ) -> BackendResult<UploadReport> {
        let backend = self.backend(kind)?;
        self.bounded(backend.upload_status(request_id, doc)).await
    }

    pub async fn start_download(
        &self,
        kind: TransferType,
        request: DownloadRequest,
    ) -> BackendResult<DownloadStarted> {
        let backend = self.backend(kind)?;
        self.bounded(backend.start_download(request)).await
    }

    pub async fn download_status(
        &self,
        kind: TransferType,
        request_id: &str,
        doc: &str,
    ) -> BackendResult<DownloadReport> {
        let backend = self.backend(kind)?;
        self.bounded(backend.download_status(request_id, doc)).await
    }

    pub async fn fetch_staged_file(
        &self,
        kind: TransferType,
        object_id: &str,
    ) -> BackendResult<StagedFile> {
        let backend = self.backend(kind)?;
        self.bounded(backend.fetch_staged_file(object_id)).await
    }

    pub fn tier_supported(
        &self,
        configuration_id: &str,
        s3_archive_configuration_id: Option<&str>,
        kind: TransferType,
    ) -> bool {
        self.backends.contains_key(&kind)
            && self
                .tiering
                .is_tiering_supported(configuration_id, s3_archive_configuration_id, kind)
    }

    pub async fn submit_tier(
        &self,
        kind: TransferType,
        submission: TierSubmission,
    ) -> BackendResult<()> {
        let backend = self.backend(kind)?;
        self.bounded(backend.submit_tier(submission)).await
    }

    pub async fn delete_object(
        &self,
        kind: TransferType,
        location: &FileLocation,
        doc: &str,
    ) -> BackendResult<()> {
        let backend = self.backend(kind)?;
        self.bounded(backend.delete_object(location, doc)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[tokio::test]
    async fn unregistered_backend_is_unsupported() {
        let client = TransferClient::new(Arc::new(TieringConfig::default()), Duration::from_secs(1));
        let err = client
            .upload_status(TransferType::Globus, "req-1", "DOC")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unsupported(TransferType::Globus)));
    }

    #[tokio::test]
    async fn slow_backend_calls_time_out() {
        let fake = Arc::new(FakeBackend::default());
        fake.set_delay(Duration::from_millis(200));
        let client = TransferClient::new(Arc::new(TieringConfig::default()), Duration::from_millis(20))
            .with_backend(TransferType::Globus, fake);

        let err = client
            .upload_status(TransferType::Globus, "req-1", "DOC")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }
}
