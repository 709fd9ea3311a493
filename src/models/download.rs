//! Download tasks: single data-object downloads and collection downloads that
//! fan out into many of them.

use super::data_object::{FileLocation, TransferType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal outcome of a download.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadResult {
    Completed,
    Failed,
    Canceled,
}

/// One in-flight single-object download (the active set).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DataObjectDownloadTask {
    pub id: Uuid,
    pub path: String,
    pub destination_location: FileLocation,
    pub transfer_type: TransferType,
    pub transfer_request_id: String,
    pub user_id: String,
    pub doc: String,

    /// Whether the completer notifies the user. False when a parent collection task
    /// owns notification.
    pub completion_event: bool,

    pub created_at: DateTime<Utc>,
}

/// Terminal record of a data-object download, kept in the history set.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadTaskResult {
    pub id: Uuid,
    pub path: String,
    pub destination_location: FileLocation,
    pub transfer_type: TransferType,
    pub user_id: String,
    pub result: DownloadResult,
    pub message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Status answer for a data-object download task id.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadTaskStatus {
    InProgress,
    Completed {
        result: DownloadResult,
        message: Option<String>,
    },
}

/// What a caller gets back from submitting a data-object download.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DownloadSubmission {
    pub task_id: Uuid,
    pub destination_location: FileLocation,
    pub status: DownloadTaskStatus,
}

#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionDownloadStatus {
    Received,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl CollectionDownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

/// What a fan-out download was asked for.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadTaskKind {
    /// One collection subtree.
    Collection,
    /// Several collection subtrees, each under its own final segment.
    CollectionList,
    /// An explicit list of data objects.
    DataObjectList,
}

/// One data object inside a collection download.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CollectionDownloadTaskItem {
    pub path: String,
    pub destination_location: FileLocation,

    /// Weak reference to the child download task; lookup only.
    pub data_object_download_task_id: Option<Uuid>,

    /// `None` while the child download is unresolved.
    pub result: Option<DownloadResult>,

    pub message: Option<String>,
}

impl CollectionDownloadTaskItem {
    pub fn submitted(path: String, destination_location: FileLocation, task_id: Uuid) -> Self {
        Self {
            path,
            destination_location,
            data_object_download_task_id: Some(task_id),
            result: None,
            message: None,
        }
    }

    pub fn failed(path: String, destination_location: FileLocation, message: String) -> Self {
        Self {
            path,
            destination_location,
            data_object_download_task_id: None,
            result: Some(DownloadResult::Failed),
            message: Some(message),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

/// One in-flight collection or list download.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CollectionDownloadTask {
    pub id: Uuid,
    pub kind: DownloadTaskKind,

    /// Display path: the collection, or the requested paths joined by `, `.
    pub path: String,

    /// Requested logical paths, in request order.
    pub paths: Vec<String>,

    pub destination_location: FileLocation,
    pub user_id: String,
    pub doc: String,
    pub status: CollectionDownloadStatus,
    pub cancellation_requested: bool,

    /// Depth-first insertion order.
    pub items: Vec<CollectionDownloadTaskItem>,

    pub result: Option<bool>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CollectionDownloadTask {
    pub fn received(
        path: String,
        destination_location: FileLocation,
        user_id: String,
        doc: String,
    ) -> Self {
        Self::received_list(
            DownloadTaskKind::Collection,
            vec![path],
            destination_location,
            user_id,
            doc,
        )
    }

    pub fn received_list(
        kind: DownloadTaskKind,
        paths: Vec<String>,
        destination_location: FileLocation,
        user_id: String,
        doc: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            path: paths.join(", "),
            paths,
            destination_location,
            user_id,
            doc,
            status: CollectionDownloadStatus::Received,
            cancellation_requested: false,
            items: Vec::new(),
            result: None,
            message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn all_items_resolved(&self) -> bool {
        self.items.iter().all(CollectionDownloadTaskItem::is_resolved)
    }

    fn items_with(&self, result: DownloadResult) -> usize {
        self.items
            .iter()
            .filter(|item| item.result == Some(result))
            .count()
    }

    pub fn succeeded_items(&self) -> usize {
        self.items_with(DownloadResult::Completed)
    }

    pub fn canceled_items(&self) -> usize {
        self.items_with(DownloadResult::Canceled)
    }
}
