//! src/services/posix_archive.rs
//!
//! PosixArchive: a filesystem backend used for both the temporary staging area
//! (first hop of two-hop uploads) and the POSIX permanent archive. Object payloads
//! are sharded beneath `base_path/{shard}/{shard}/{object_id}`. Transfers finish
//! synchronously, so status queries always report the terminal state.

use crate::models::data_object::{FileLocation, TransferType, UploadStatus};
use crate::models::tiering::TierSubmission;
use crate::services::backend::{
    BackendError, BackendResult, DownloadReport, DownloadRequest, DownloadStarted, StagedFile,
    TransferBackend, UploadReport, UploadRequest, UploadResponse, UploadSource,
};
use async_trait::async_trait;
use futures::StreamExt;
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_ID_LEN: usize = 1024;

#[derive(Clone, Debug)]
pub struct PosixArchive {
    /// Which role this archive plays (`Temp` or `Posix`).
    kind: TransferType,

    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    /// Directory user download destinations are resolved under.
    download_root: PathBuf,
}

impl PosixArchive {
    pub fn new(
        kind: TransferType,
        base_path: impl Into<PathBuf>,
        download_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind,
            base_path: base_path.into(),
            download_root: download_root.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn container_id(&self) -> String {
        self.base_path.display().to_string()
    }

    /// Reject object ids that could escape the archive root.
    fn ensure_object_id_safe(object_id: &str) -> BackendResult<&str> {
        let relative = object_id.trim_start_matches('/');
        if relative.is_empty()
            || relative.len() > MAX_OBJECT_ID_LEN
            || relative.split('/').any(|segment| segment == "..")
            || relative
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BackendError::Rejected(format!(
                "invalid object id `{}`",
                object_id
            )));
        }
        Ok(relative)
    }

    /// Two-level shard identifiers from MD5(object id).
    fn object_shards(object_id: &str) -> (String, String) {
        let digest = md5::compute(object_id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, object_id: &str) -> BackendResult<PathBuf> {
        let relative = Self::ensure_object_id_safe(object_id)?;
        let (shard_a, shard_b) = Self::object_shards(relative);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(relative);
        Ok(path)
    }

    fn destination_path(&self, destination: &FileLocation) -> BackendResult<PathBuf> {
        let relative = Self::ensure_object_id_safe(&destination.object_id)?;
        Ok(self.download_root.join(relative))
    }

    /// Stream `source` into the archive at `object_id`, returning the MD5 checksum.
    ///
    /// Writes to a temporary file, fsyncs, then renames into place.
    async fn store_file(&self, source: &Path, object_id: &str) -> BackendResult<String> {
        let file_path = self.object_path(object_id)?;
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        let input = File::open(source).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::StagedFileNotFound(source.display().to_string())
            } else {
                BackendError::Io(err)
            }
        })?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        let mut digest = Context::new();
        let mut stream = ReaderStream::new(input);

        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BackendError::Io(err));
                }
            };
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Io(err));
            }
        }

        Ok(format!("{:x}", digest.compute()))
    }

    /// Status an upload into this archive ends in.
    fn landed_status(&self) -> UploadStatus {
        match self.kind {
            TransferType::Temp => UploadStatus::InTemporaryArchive,
            _ => UploadStatus::Archived,
        }
    }

    /// Remove empty shard directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl TransferBackend for PosixArchive {
    async fn start_upload(&self, request: UploadRequest) -> BackendResult<UploadResponse> {
        let UploadSource::File(source) = &request.source else {
            return Err(BackendError::OperationNotSupported(self.kind));
        };

        let checksum = self.store_file(source, &request.path).await?;
        debug!(
            "stored {} into {} archive ({})",
            request.path, self.kind, checksum
        );

        Ok(UploadResponse {
            archive_location: FileLocation::new(self.container_id(), request.path.clone()),
            request_id: Uuid::new_v4().to_string(),
            checksum: Some(checksum),
            status: self.landed_status(),
        })
    }

    async fn upload_status(&self, _request_id: &str, _doc: &str) -> BackendResult<UploadReport> {
        Ok(UploadReport::new(self.landed_status()))
    }

    async fn start_download(&self, request: DownloadRequest) -> BackendResult<DownloadStarted> {
        let source = self.object_path(&request.archive_location.object_id)?;
        let destination = self.destination_path(&request.destination)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let report = match fs::copy(&source, &destination).await {
            Ok(_) => DownloadReport::completed(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                DownloadReport::failed(format!("archive object {} is missing", source.display()))
            }
            Err(err) => return Err(BackendError::Io(err)),
        };

        Ok(DownloadStarted {
            request_id: Uuid::new_v4().to_string(),
            report,
        })
    }

    async fn download_status(&self, _request_id: &str, _doc: &str) -> BackendResult<DownloadReport> {
        Ok(DownloadReport::completed())
    }

    async fn fetch_staged_file(&self, object_id: &str) -> BackendResult<StagedFile> {
        let path = self.object_path(object_id)?;
        let meta = fs::metadata(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::StagedFileNotFound(object_id.to_string())
            } else {
                BackendError::Io(err)
            }
        })?;

        Ok(StagedFile {
            location: FileLocation::new(self.container_id(), object_id),
            path,
            size: meta.len(),
        })
    }

    async fn submit_tier(&self, _submission: TierSubmission) -> BackendResult<()> {
        Err(BackendError::OperationNotSupported(self.kind))
    }

    async fn delete_object(&self, location: &FileLocation, _doc: &str) -> BackendResult<()> {
        let file_path = self.object_path(&location.object_id)?;
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }
}
