//! Represents an archived (or in-flight) data object and its system metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backend discriminator for where an object's bytes live or travel through.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferType {
    /// POSIX staging area used as the first hop of two-hop uploads.
    Temp,
    S3,
    Globus,
    Posix,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temp => "TEMP",
            Self::S3 => "S3",
            Self::Globus => "GLOBUS",
            Self::Posix => "POSIX",
        }
    }

    /// Downloads through this backend finish with a second, separately tracked hop
    /// (backend to user endpoint) that must be polled for completion.
    pub fn requires_async_completion(&self) -> bool {
        matches!(self, Self::Globus)
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "TEMP" => Ok(Self::Temp),
            "S3" | "S_3" => Ok(Self::S3),
            "GLOBUS" => Ok(Self::Globus),
            "POSIX" => Ok(Self::Posix),
            other => Err(format!("unknown transfer type `{}`", other)),
        }
    }
}

/// Upload lifecycle of a data object.
///
/// Moves forward only:
/// - `InProgressToArchive` -> `Archived` | `Failed` | `Unknown`
/// - `InProgressToTemporaryArchive` -> `InTemporaryArchive` | `Failed` | `Unknown`
/// - `InTemporaryArchive` -> `Archived` | `Failed` | `Unknown`
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    InProgressToArchive,
    InProgressToTemporaryArchive,
    InTemporaryArchive,
    Archived,
    Failed,
    Unknown,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgressToArchive => "IN_PROGRESS_TO_ARCHIVE",
            Self::InProgressToTemporaryArchive => "IN_PROGRESS_TO_TEMPORARY_ARCHIVE",
            Self::InTemporaryArchive => "IN_TEMPORARY_ARCHIVE",
            Self::Archived => "ARCHIVED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (InProgressToArchive, Archived | Failed | Unknown)
                | (
                    InProgressToTemporaryArchive,
                    InTemporaryArchive | Failed | Unknown
                )
                | (InTemporaryArchive, Archived | Failed | Unknown)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a tiering (deep archive) request, tracked apart from the upload status.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeepArchiveStatus {
    InProgress,
    DeepArchived,
}

/// Backend coordinates of stored bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileLocation {
    /// Bucket, endpoint or archive root.
    pub container_id: String,

    /// Key or path of the object inside the container.
    pub object_id: String,
}

impl FileLocation {
    pub fn new(container_id: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            object_id: object_id.into(),
        }
    }
}

impl fmt::Display for FileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container_id, self.object_id)
    }
}

/// One archived or in-flight unit of data, keyed by its logical `path`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DataObjectRecord {
    pub path: String,

    /// Parent collection path.
    pub collection_path: String,

    pub upload_status: UploadStatus,

    /// Set once the status reaches `Archived` or `InTemporaryArchive`.
    pub archive_location: Option<FileLocation>,

    pub source_location: Option<FileLocation>,

    pub transfer_type: TransferType,

    pub transfer_request_id: Option<String>,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    pub registrar_id: String,

    pub caller_object_id: Option<String>,

    /// Tenant scope used to pick the backend configuration.
    pub doc: String,

    pub configuration_id: String,

    /// Backend (archive) configuration the bytes were written with.
    pub s3_archive_configuration_id: Option<String>,

    /// Set when this record is a soft link to another data object.
    pub link_source_path: Option<String>,

    pub checksum: Option<String>,

    pub deep_archive_status: Option<DeepArchiveStatus>,

    pub deep_archive_date: Option<DateTime<Utc>>,
}

impl DataObjectRecord {
    pub fn is_link(&self) -> bool {
        self.link_source_path
            .as_deref()
            .is_some_and(|source| !source.is_empty())
    }
}

/// Fields written together with an upload-status transition.
#[derive(Clone, Debug, Default)]
pub struct UploadTransition {
    pub archive_location: Option<FileLocation>,
    pub transfer_request_id: Option<String>,
    pub transfer_type: Option<TransferType>,
    pub checksum: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}
