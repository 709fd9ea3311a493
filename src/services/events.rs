//! Domain events recorded for downstream notification delivery.

use crate::models::data_object::{FileLocation, TransferType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// What happened, with enough context to render a notification.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainEvent {
    UploadArchived {
        user_id: String,
        path: String,
        source_location: Option<FileLocation>,
        completed: DateTime<Utc>,
    },
    UploadInTempArchive {
        user_id: String,
        path: String,
        source_location: Option<FileLocation>,
    },
    UploadFailed {
        user_id: String,
        path: String,
        source_location: Option<FileLocation>,
        message: String,
    },
    DownloadCompleted {
        user_id: String,
        path: String,
        task_id: Uuid,
        transfer_type: Option<TransferType>,
        destination: FileLocation,
        completed: DateTime<Utc>,
        message: Option<String>,
    },
    DownloadFailed {
        user_id: String,
        path: String,
        task_id: Uuid,
        transfer_type: Option<TransferType>,
        destination: FileLocation,
        completed: DateTime<Utc>,
        message: String,
    },
    DownloadCanceled {
        user_id: String,
        path: String,
        task_id: Uuid,
        transfer_type: Option<TransferType>,
        destination: FileLocation,
        completed: DateTime<Utc>,
        message: Option<String>,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UploadArchived { .. } => "UPLOAD_ARCHIVED",
            Self::UploadInTempArchive { .. } => "UPLOAD_IN_TEMP_ARCHIVE",
            Self::UploadFailed { .. } => "UPLOAD_FAILED",
            Self::DownloadCompleted { .. } => "DOWNLOAD_COMPLETED",
            Self::DownloadFailed { .. } => "DOWNLOAD_FAILED",
            Self::DownloadCanceled { .. } => "DOWNLOAD_CANCELED",
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::UploadArchived { user_id, .. }
            | Self::UploadInTempArchive { user_id, .. }
            | Self::UploadFailed { user_id, .. }
            | Self::DownloadCompleted { user_id, .. }
            | Self::DownloadFailed { user_id, .. }
            | Self::DownloadCanceled { user_id, .. } => user_id,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::UploadArchived { path, .. }
            | Self::UploadInTempArchive { path, .. }
            | Self::UploadFailed { path, .. }
            | Self::DownloadCompleted { path, .. }
            | Self::DownloadFailed { path, .. }
            | Self::DownloadCanceled { path, .. } => path,
        }
    }
}

#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: DomainEvent) -> Result<(), EventError>;
}

/// Appends events to the `events` table.
#[derive(Clone)]
pub struct SqliteEventLog {
    pub db: Arc<SqlitePool>,
}

impl SqliteEventLog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventEmitter for SqliteEventLog {
    async fn emit(&self, event: DomainEvent) -> Result<(), EventError> {
        let payload = serde_json::to_string(&event)?;
        sqlx::query(
            "INSERT INTO events (id, user_id, event_type, path, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(event.user_id())
        .bind(event.kind())
        .bind(event.path())
        .bind(payload)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::memory_pool;

    #[tokio::test]
    async fn events_are_persisted_with_json_payload() {
        let pool = memory_pool().await;
        let log = SqliteEventLog::new(pool.clone());

        log.emit(DomainEvent::UploadFailed {
            user_id: "registrar".into(),
            path: "/p/a".into(),
            source_location: None,
            message: "transfer failed".into(),
        })
        .await
        .unwrap();

        let (kind, path, payload): (String, String, String) =
            sqlx::query_as("SELECT event_type, path, payload FROM events")
                .fetch_one(&*pool)
                .await
                .unwrap();
        assert_eq!(kind, "UPLOAD_FAILED");
        assert_eq!(path, "/p/a");

        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "UPLOAD_FAILED");
        assert_eq!(json["message"], "transfer failed");
    }
}
