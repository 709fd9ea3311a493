//! src/services/catalog.rs
//!
//! Catalog accessor: path metadata, hierarchy and transfer-task bookkeeping.
//! [`SqliteCatalog`] keeps everything in SQLite through `sqlx`. Upload-status
//! writes are compare-and-set against the expected current status so a stale
//! sweep can never move a record backwards.

use crate::models::{
    collection::{CollectionListing, parent_path},
    data_object::{
        DataObjectRecord, DeepArchiveStatus, FileLocation, TransferType, UploadStatus,
        UploadTransition,
    },
    download::{
        CollectionDownloadStatus, CollectionDownloadTask, CollectionDownloadTaskItem,
        DataObjectDownloadTask, DownloadResult, DownloadTaskKind, DownloadTaskResult,
        DownloadTaskStatus,
    },
    tiering::DataMigrationTask,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("illegal upload status transition {from} -> {to} for `{path}`")]
    IllegalTransition {
        path: String,
        from: UploadStatus,
        to: UploadStatus,
    },
    #[error("`{0}` already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Read/write access to path metadata, hierarchy and task state.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// One level of the hierarchy under `path`, or `None` if no such collection.
    async fn get_collection(&self, path: &str) -> CatalogResult<Option<CollectionListing>>;

    async fn insert_collection(&self, path: &str, configuration_id: Option<&str>)
    -> CatalogResult<()>;

    async fn get_data_object(&self, path: &str) -> CatalogResult<Option<DataObjectRecord>>;

    async fn insert_data_object(&self, record: &DataObjectRecord) -> CatalogResult<()>;

    async fn data_objects_by_upload_status(
        &self,
        statuses: &[UploadStatus],
    ) -> CatalogResult<Vec<DataObjectRecord>>;

    /// Data objects whose archive object id is `prefix` or lies beneath it.
    async fn data_objects_archived_under(&self, prefix: &str)
    -> CatalogResult<Vec<DataObjectRecord>>;

    /// Move `path` from `from` to `to`, writing `fields` alongside.
    ///
    /// Returns `false` when the record is no longer in `from` (already moved by
    /// another pass, or deleted).
    async fn transition_upload_status(
        &self,
        path: &str,
        from: UploadStatus,
        to: UploadStatus,
        fields: &UploadTransition,
    ) -> CatalogResult<bool>;

    async fn set_deep_archive_status(
        &self,
        path: &str,
        status: DeepArchiveStatus,
        at: DateTime<Utc>,
    ) -> CatalogResult<()>;

    /// Remove a data object (registration rollback). Returns whether a row was removed.
    async fn delete_data_object(&self, path: &str) -> CatalogResult<bool>;

    async fn insert_download_task(&self, task: &DataObjectDownloadTask) -> CatalogResult<()>;

    /// Active tasks whose backend needs its completion polled. Tasks with a
    /// pending cancellation are left out.
    async fn active_download_tasks(&self) -> CatalogResult<Vec<DataObjectDownloadTask>>;

    /// Active tasks whose owner asked for cancellation.
    async fn canceled_download_tasks(&self) -> CatalogResult<Vec<DataObjectDownloadTask>>;

    /// Flag an active task for cancellation. Returns `false` when the task is not
    /// in the active set.
    async fn request_download_cancellation(&self, id: Uuid) -> CatalogResult<bool>;

    /// Move a task out of the active set and record its terminal result.
    async fn complete_download_task(&self, result: &DownloadTaskResult) -> CatalogResult<()>;

    async fn download_task_status(&self, id: Uuid) -> CatalogResult<Option<DownloadTaskStatus>>;

    async fn insert_collection_download_task(
        &self,
        task: &CollectionDownloadTask,
    ) -> CatalogResult<()>;

    async fn collection_download_tasks(
        &self,
        status: CollectionDownloadStatus,
    ) -> CatalogResult<Vec<CollectionDownloadTask>>;

    async fn get_collection_download_task(
        &self,
        id: Uuid,
    ) -> CatalogResult<Option<CollectionDownloadTask>>;

    /// Persist status, result and the full item list of a collection download.
    /// The cancellation flag is left as stored.
    async fn update_collection_download_task(
        &self,
        task: &CollectionDownloadTask,
    ) -> CatalogResult<()>;

    /// Flag a RECEIVED or IN_PROGRESS collection download for cancellation.
    /// Returns `false` when the task is missing or already finished.
    async fn request_collection_download_cancellation(&self, id: Uuid) -> CatalogResult<bool>;

    async fn insert_migration_task(&self, task: &DataMigrationTask) -> CatalogResult<()>;
}

/// Apply the embedded schema. Statements are idempotent.
pub async fn run_migrations(db: &SqlitePool) -> CatalogResult<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

#[derive(Clone)]
pub struct SqliteCatalog {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

const DATA_OBJECT_COLUMNS: &str = "path, collection_path, upload_status, archive_container_id, \
     archive_object_id, source_container_id, source_object_id, transfer_type, \
     transfer_request_id, created_at, completed_at, registrar_id, caller_object_id, doc, \
     configuration_id, s3_archive_configuration_id, link_source_path, checksum, \
     deep_archive_status, deep_archive_date";

#[derive(FromRow)]
struct DataObjectRow {
    path: String,
    collection_path: String,
    upload_status: UploadStatus,
    archive_container_id: Option<String>,
    archive_object_id: Option<String>,
    source_container_id: Option<String>,
    source_object_id: Option<String>,
    transfer_type: TransferType,
    transfer_request_id: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    registrar_id: String,
    caller_object_id: Option<String>,
    doc: String,
    configuration_id: String,
    s3_archive_configuration_id: Option<String>,
    link_source_path: Option<String>,
    checksum: Option<String>,
    deep_archive_status: Option<DeepArchiveStatus>,
    deep_archive_date: Option<DateTime<Utc>>,
}

fn location(container: Option<String>, object: Option<String>) -> Option<FileLocation> {
    match (container, object) {
        (Some(container_id), Some(object_id)) => Some(FileLocation {
            container_id,
            object_id,
        }),
        _ => None,
    }
}

impl From<DataObjectRow> for DataObjectRecord {
    fn from(row: DataObjectRow) -> Self {
        Self {
            path: row.path,
            collection_path: row.collection_path,
            upload_status: row.upload_status,
            archive_location: location(row.archive_container_id, row.archive_object_id),
            source_location: location(row.source_container_id, row.source_object_id),
            transfer_type: row.transfer_type,
            transfer_request_id: row.transfer_request_id,
            created_at: row.created_at,
            completed_at: row.completed_at,
            registrar_id: row.registrar_id,
            caller_object_id: row.caller_object_id,
            doc: row.doc,
            configuration_id: row.configuration_id,
            s3_archive_configuration_id: row.s3_archive_configuration_id,
            link_source_path: row.link_source_path,
            checksum: row.checksum,
            deep_archive_status: row.deep_archive_status,
            deep_archive_date: row.deep_archive_date,
        }
    }
}

const DOWNLOAD_TASK_COLUMNS: &str = "id, path, destination_container_id, \
     destination_object_id, transfer_type, transfer_request_id, user_id, doc, \
     completion_event, created_at";

const COLLECTION_TASK_COLUMNS: &str = "id, kind, path, paths, destination_container_id, \
     destination_object_id, user_id, doc, status, cancellation_requested, result, message, \
     created_at, completed_at";

#[derive(FromRow)]
struct DownloadTaskRow {
    id: Uuid,
    path: String,
    destination_container_id: String,
    destination_object_id: String,
    transfer_type: TransferType,
    transfer_request_id: String,
    user_id: String,
    doc: String,
    completion_event: bool,
    created_at: DateTime<Utc>,
}

impl From<DownloadTaskRow> for DataObjectDownloadTask {
    fn from(row: DownloadTaskRow) -> Self {
        Self {
            id: row.id,
            path: row.path,
            destination_location: FileLocation::new(
                row.destination_container_id,
                row.destination_object_id,
            ),
            transfer_type: row.transfer_type,
            transfer_request_id: row.transfer_request_id,
            user_id: row.user_id,
            doc: row.doc,
            completion_event: row.completion_event,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct CollectionTaskRow {
    id: Uuid,
    kind: DownloadTaskKind,
    path: String,
    paths: String,
    destination_container_id: String,
    destination_object_id: String,
    user_id: String,
    doc: String,
    status: CollectionDownloadStatus,
    cancellation_requested: bool,
    result: Option<bool>,
    message: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct CollectionItemRow {
    path: String,
    destination_container_id: String,
    destination_object_id: String,
    data_object_download_task_id: Option<Uuid>,
    result: Option<DownloadResult>,
    message: Option<String>,
}

impl From<CollectionItemRow> for CollectionDownloadTaskItem {
    fn from(row: CollectionItemRow) -> Self {
        Self {
            path: row.path,
            destination_location: FileLocation::new(
                row.destination_container_id,
                row.destination_object_id,
            ),
            data_object_download_task_id: row.data_object_download_task_id,
            result: row.result,
            message: row.message,
        }
    }
}

impl SqliteCatalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn load_items(&self, task_id: Uuid) -> CatalogResult<Vec<CollectionDownloadTaskItem>> {
        let rows = sqlx::query_as::<_, CollectionItemRow>(
            "SELECT path, destination_container_id, destination_object_id,
                    data_object_download_task_id, result, message
             FROM collection_download_task_items
             WHERE task_id = ? ORDER BY position ASC",
        )
        .bind(task_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn hydrate(&self, row: CollectionTaskRow) -> CatalogResult<CollectionDownloadTask> {
        let items = self.load_items(row.id).await?;
        Ok(CollectionDownloadTask {
            id: row.id,
            kind: row.kind,
            path: row.path,
            paths: serde_json::from_str(&row.paths)?,
            destination_location: FileLocation::new(
                row.destination_container_id,
                row.destination_object_id,
            ),
            user_id: row.user_id,
            doc: row.doc,
            status: row.status,
            cancellation_requested: row.cancellation_requested,
            items,
            result: row.result,
            message: row.message,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn get_collection(&self, path: &str) -> CatalogResult<Option<CollectionListing>> {
        let configuration_id = sqlx::query_scalar::<_, Option<String>>(
            "SELECT configuration_id FROM collections WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&*self.db)
        .await?;

        let Some(configuration_id) = configuration_id else {
            return Ok(None);
        };

        let data_objects = sqlx::query_scalar::<_, String>(
            "SELECT path FROM data_objects WHERE collection_path = ? ORDER BY path ASC",
        )
        .bind(path)
        .fetch_all(&*self.db)
        .await?;

        let sub_collections = sqlx::query_scalar::<_, String>(
            "SELECT path FROM collections WHERE parent_path = ? ORDER BY path ASC",
        )
        .bind(path)
        .fetch_all(&*self.db)
        .await?;

        Ok(Some(CollectionListing {
            path: path.to_string(),
            configuration_id,
            data_objects,
            sub_collections,
        }))
    }

    async fn insert_collection(
        &self,
        path: &str,
        configuration_id: Option<&str>,
    ) -> CatalogResult<()> {
        let parent = (path != "/").then(|| parent_path(path).to_string());
        sqlx::query(
            "INSERT INTO collections (path, parent_path, configuration_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(path)
        .bind(parent)
        .bind(configuration_id)
        .bind(Utc::now())
        .execute(&*self.db)
        .await
        .map_err(|err| match err {
            err if is_unique_violation(&err) => CatalogError::AlreadyExists(path.to_string()),
            other => CatalogError::Sqlx(other),
        })?;
        Ok(())
    }

    async fn get_data_object(&self, path: &str) -> CatalogResult<Option<DataObjectRecord>> {
        let row = sqlx::query_as::<_, DataObjectRow>(&format!(
            "SELECT {} FROM data_objects WHERE path = ?",
            DATA_OBJECT_COLUMNS
        ))
        .bind(path)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn insert_data_object(&self, record: &DataObjectRecord) -> CatalogResult<()> {
        let archive = record.archive_location.as_ref();
        let source = record.source_location.as_ref();
        sqlx::query(&format!(
            "INSERT INTO data_objects ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            DATA_OBJECT_COLUMNS
        ))
        .bind(&record.path)
        .bind(&record.collection_path)
        .bind(record.upload_status)
        .bind(archive.map(|l| l.container_id.as_str()))
        .bind(archive.map(|l| l.object_id.as_str()))
        .bind(source.map(|l| l.container_id.as_str()))
        .bind(source.map(|l| l.object_id.as_str()))
        .bind(record.transfer_type)
        .bind(record.transfer_request_id.as_deref())
        .bind(record.created_at)
        .bind(record.completed_at)
        .bind(&record.registrar_id)
        .bind(record.caller_object_id.as_deref())
        .bind(&record.doc)
        .bind(&record.configuration_id)
        .bind(record.s3_archive_configuration_id.as_deref())
        .bind(record.link_source_path.as_deref())
        .bind(record.checksum.as_deref())
        .bind(record.deep_archive_status)
        .bind(record.deep_archive_date)
        .execute(&*self.db)
        .await
        .map_err(|err| match err {
            err if is_unique_violation(&err) => CatalogError::AlreadyExists(record.path.clone()),
            other => CatalogError::Sqlx(other),
        })?;
        Ok(())
    }

    async fn data_objects_by_upload_status(
        &self,
        statuses: &[UploadStatus],
    ) -> CatalogResult<Vec<DataObjectRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM data_objects WHERE upload_status IN (",
            DATA_OBJECT_COLUMNS
        ));
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        separated.push_unseparated(") ORDER BY created_at ASC, path ASC");

        let rows: Vec<DataObjectRow> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn data_objects_archived_under(
        &self,
        prefix: &str,
    ) -> CatalogResult<Vec<DataObjectRecord>> {
        let rows = sqlx::query_as::<_, DataObjectRow>(&format!(
            "SELECT {} FROM data_objects
             WHERE archive_object_id = ?1 OR substr(archive_object_id, 1, length(?2)) = ?2
             ORDER BY path ASC",
            DATA_OBJECT_COLUMNS
        ))
        .bind(prefix)
        .bind(format!("{}/", prefix.trim_end_matches('/')))
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn transition_upload_status(
        &self,
        path: &str,
        from: UploadStatus,
        to: UploadStatus,
        fields: &UploadTransition,
    ) -> CatalogResult<bool> {
        if !from.can_transition_to(to) {
            return Err(CatalogError::IllegalTransition {
                path: path.to_string(),
                from,
                to,
            });
        }

        let archive = fields.archive_location.as_ref();
        let result = sqlx::query(
            "UPDATE data_objects SET
                upload_status = ?,
                archive_container_id = COALESCE(?, archive_container_id),
                archive_object_id = COALESCE(?, archive_object_id),
                transfer_request_id = COALESCE(?, transfer_request_id),
                transfer_type = COALESCE(?, transfer_type),
                checksum = COALESCE(?, checksum),
                completed_at = COALESCE(?, completed_at)
             WHERE path = ? AND upload_status = ?",
        )
        .bind(to)
        .bind(archive.map(|l| l.container_id.as_str()))
        .bind(archive.map(|l| l.object_id.as_str()))
        .bind(fields.transfer_request_id.as_deref())
        .bind(fields.transfer_type)
        .bind(fields.checksum.as_deref())
        .bind(fields.completed_at)
        .bind(path)
        .bind(from)
        .execute(&*self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_deep_archive_status(
        &self,
        path: &str,
        status: DeepArchiveStatus,
        at: DateTime<Utc>,
    ) -> CatalogResult<()> {
        sqlx::query(
            "UPDATE data_objects SET deep_archive_status = ?, deep_archive_date = ? WHERE path = ?",
        )
        .bind(status)
        .bind(at)
        .bind(path)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn delete_data_object(&self, path: &str) -> CatalogResult<bool> {
        let result = sqlx::query("DELETE FROM data_objects WHERE path = ?")
            .bind(path)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_download_task(&self, task: &DataObjectDownloadTask) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO data_object_download_tasks (
                id, path, destination_container_id, destination_object_id, transfer_type,
                transfer_request_id, user_id, doc, completion_event, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id)
        .bind(&task.path)
        .bind(&task.destination_location.container_id)
        .bind(&task.destination_location.object_id)
        .bind(task.transfer_type)
        .bind(&task.transfer_request_id)
        .bind(&task.user_id)
        .bind(&task.doc)
        .bind(task.completion_event)
        .bind(task.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn active_download_tasks(&self) -> CatalogResult<Vec<DataObjectDownloadTask>> {
        let rows = sqlx::query_as::<_, DownloadTaskRow>(&format!(
            "SELECT {} FROM data_object_download_tasks
             WHERE cancel_requested = 0 ORDER BY created_at ASC",
            DOWNLOAD_TASK_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(DataObjectDownloadTask::from)
            .filter(|task| task.transfer_type.requires_async_completion())
            .collect())
    }

    async fn canceled_download_tasks(&self) -> CatalogResult<Vec<DataObjectDownloadTask>> {
        let rows = sqlx::query_as::<_, DownloadTaskRow>(&format!(
            "SELECT {} FROM data_object_download_tasks
             WHERE cancel_requested = 1 ORDER BY created_at ASC",
            DOWNLOAD_TASK_COLUMNS
        ))
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn request_download_cancellation(&self, id: Uuid) -> CatalogResult<bool> {
        let result =
            sqlx::query("UPDATE data_object_download_tasks SET cancel_requested = 1 WHERE id = ?")
                .bind(id)
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_download_task(&self, result: &DownloadTaskResult) -> CatalogResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO download_task_results (
                id, path, destination_container_id, destination_object_id, transfer_type,
                user_id, result, message, completed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(result.id)
        .bind(&result.path)
        .bind(&result.destination_location.container_id)
        .bind(&result.destination_location.object_id)
        .bind(result.transfer_type)
        .bind(&result.user_id)
        .bind(result.result)
        .bind(result.message.as_deref())
        .bind(result.completed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM data_object_download_tasks WHERE id = ?")
            .bind(result.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn download_task_status(&self, id: Uuid) -> CatalogResult<Option<DownloadTaskStatus>> {
        let active = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM data_object_download_tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await?;
        if active > 0 {
            return Ok(Some(DownloadTaskStatus::InProgress));
        }

        let finished = sqlx::query_as::<_, (DownloadResult, Option<String>)>(
            "SELECT result, message FROM download_task_results WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        Ok(finished.map(|(result, message)| DownloadTaskStatus::Completed { result, message }))
    }

    async fn insert_collection_download_task(
        &self,
        task: &CollectionDownloadTask,
    ) -> CatalogResult<()> {
        sqlx::query(&format!(
            "INSERT INTO collection_download_tasks ({})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLLECTION_TASK_COLUMNS
        ))
        .bind(task.id)
        .bind(task.kind)
        .bind(&task.path)
        .bind(serde_json::to_string(&task.paths)?)
        .bind(&task.destination_location.container_id)
        .bind(&task.destination_location.object_id)
        .bind(&task.user_id)
        .bind(&task.doc)
        .bind(task.status)
        .bind(task.cancellation_requested)
        .bind(task.result)
        .bind(task.message.as_deref())
        .bind(task.created_at)
        .bind(task.completed_at)
        .execute(&*self.db)
        .await?;

        if !task.items.is_empty() {
            self.update_collection_download_task(task).await?;
        }
        Ok(())
    }

    async fn collection_download_tasks(
        &self,
        status: CollectionDownloadStatus,
    ) -> CatalogResult<Vec<CollectionDownloadTask>> {
        let rows = sqlx::query_as::<_, CollectionTaskRow>(&format!(
            "SELECT {} FROM collection_download_tasks WHERE status = ? ORDER BY created_at ASC",
            COLLECTION_TASK_COLUMNS
        ))
        .bind(status)
        .fetch_all(&*self.db)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(self.hydrate(row).await?);
        }
        Ok(tasks)
    }

    async fn get_collection_download_task(
        &self,
        id: Uuid,
    ) -> CatalogResult<Option<CollectionDownloadTask>> {
        let row = sqlx::query_as::<_, CollectionTaskRow>(&format!(
            "SELECT {} FROM collection_download_tasks WHERE id = ?",
            COLLECTION_TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn update_collection_download_task(
        &self,
        task: &CollectionDownloadTask,
    ) -> CatalogResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "UPDATE collection_download_tasks
             SET status = ?, result = ?, message = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(task.status)
        .bind(task.result)
        .bind(task.message.as_deref())
        .bind(task.completed_at)
        .bind(task.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM collection_download_task_items WHERE task_id = ?")
            .bind(task.id)
            .execute(&mut *tx)
            .await?;

        for (position, item) in task.items.iter().enumerate() {
            sqlx::query(
                "INSERT INTO collection_download_task_items (
                    task_id, position, path, destination_container_id, destination_object_id,
                    data_object_download_task_id, result, message
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(task.id)
            .bind(position as i64)
            .bind(&item.path)
            .bind(&item.destination_location.container_id)
            .bind(&item.destination_location.object_id)
            .bind(item.data_object_download_task_id)
            .bind(item.result)
            .bind(item.message.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn request_collection_download_cancellation(&self, id: Uuid) -> CatalogResult<bool> {
        let result = sqlx::query(
            "UPDATE collection_download_tasks SET cancellation_requested = 1
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(id)
        .bind(CollectionDownloadStatus::Received)
        .bind(CollectionDownloadStatus::InProgress)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_migration_task(&self, task: &DataMigrationTask) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO data_migration_tasks (
                id, path, user_id, configuration_id, from_s3_archive_configuration_id,
                to_s3_archive_configuration_id, transfer_type, status, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.id)
        .bind(&task.path)
        .bind(&task.user_id)
        .bind(&task.configuration_id)
        .bind(task.from_s3_archive_configuration_id.as_deref())
        .bind(&task.to_s3_archive_configuration_id)
        .bind(task.transfer_type)
        .bind(task.status)
        .bind(task.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_catalog, record};
    use chrono::Duration;

    #[tokio::test]
    async fn collection_listing_returns_direct_children_only() {
        let catalog = memory_catalog().await;
        catalog.insert_collection("/proj", Some("cfg")).await.unwrap();
        catalog.insert_collection("/proj/run1", Some("cfg")).await.unwrap();
        catalog.insert_collection("/proj/run1/lane", Some("cfg")).await.unwrap();
        catalog
            .insert_data_object(&record("/proj/b.dat", UploadStatus::Archived))
            .await
            .unwrap();
        catalog
            .insert_data_object(&record("/proj/a.dat", UploadStatus::Archived))
            .await
            .unwrap();
        catalog
            .insert_data_object(&record("/proj/run1/c.dat", UploadStatus::Archived))
            .await
            .unwrap();

        let listing = catalog.get_collection("/proj").await.unwrap().unwrap();
        assert_eq!(listing.data_objects, vec!["/proj/a.dat", "/proj/b.dat"]);
        assert_eq!(listing.sub_collections, vec!["/proj/run1"]);
        assert_eq!(listing.configuration_id.as_deref(), Some("cfg"));

        assert!(catalog.get_collection("/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_collection_is_reported() {
        let catalog = memory_catalog().await;
        catalog.insert_collection("/proj", None).await.unwrap();
        let err = catalog.insert_collection("/proj", None).await.unwrap_err();
        assert!(matches!(err, CatalogError::AlreadyExists(path) if path == "/proj"));
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let catalog = memory_catalog().await;
        catalog
            .insert_data_object(&record("/p/a", UploadStatus::InProgressToArchive))
            .await
            .unwrap();

        let fields = UploadTransition {
            archive_location: Some(FileLocation::new("bucket", "/p/a")),
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        assert!(
            catalog
                .transition_upload_status(
                    "/p/a",
                    UploadStatus::InProgressToArchive,
                    UploadStatus::Archived,
                    &fields,
                )
                .await
                .unwrap()
        );
        // A second pass holding the stale status changes nothing.
        assert!(
            !catalog
                .transition_upload_status(
                    "/p/a",
                    UploadStatus::InProgressToArchive,
                    UploadStatus::Unknown,
                    &UploadTransition::default(),
                )
                .await
                .unwrap()
        );

        let stored = catalog.get_data_object("/p/a").await.unwrap().unwrap();
        assert_eq!(stored.upload_status, UploadStatus::Archived);
        assert_eq!(
            stored.archive_location,
            Some(FileLocation::new("bucket", "/p/a"))
        );
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn backwards_transition_is_refused() {
        let catalog = memory_catalog().await;
        catalog
            .insert_data_object(&record("/p/a", UploadStatus::InTemporaryArchive))
            .await
            .unwrap();

        let err = catalog
            .transition_upload_status(
                "/p/a",
                UploadStatus::InTemporaryArchive,
                UploadStatus::InProgressToArchive,
                &UploadTransition::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn status_query_filters_and_orders_by_age() {
        let catalog = memory_catalog().await;
        let mut older = record("/p/z", UploadStatus::InProgressToArchive);
        older.created_at = Utc::now() - Duration::hours(5);
        catalog.insert_data_object(&older).await.unwrap();
        catalog
            .insert_data_object(&record("/p/a", UploadStatus::InProgressToTemporaryArchive))
            .await
            .unwrap();
        catalog
            .insert_data_object(&record("/p/b", UploadStatus::Archived))
            .await
            .unwrap();

        let found = catalog
            .data_objects_by_upload_status(&[
                UploadStatus::InProgressToArchive,
                UploadStatus::InProgressToTemporaryArchive,
            ])
            .await
            .unwrap();
        let paths: Vec<_> = found.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/p/z", "/p/a"]);
    }

    #[tokio::test]
    async fn completed_download_moves_to_history() {
        let catalog = memory_catalog().await;
        let task = DataObjectDownloadTask {
            id: Uuid::new_v4(),
            path: "/p/a".into(),
            destination_location: FileLocation::new("endpoint", "/home/u/a"),
            transfer_type: TransferType::Globus,
            transfer_request_id: "req-1".into(),
            user_id: "u".into(),
            doc: "DOC".into(),
            completion_event: true,
            created_at: Utc::now(),
        };
        catalog.insert_download_task(&task).await.unwrap();
        assert_eq!(
            catalog.download_task_status(task.id).await.unwrap(),
            Some(DownloadTaskStatus::InProgress)
        );
        assert_eq!(catalog.active_download_tasks().await.unwrap().len(), 1);

        catalog
            .complete_download_task(&DownloadTaskResult {
                id: task.id,
                path: task.path.clone(),
                destination_location: task.destination_location.clone(),
                transfer_type: task.transfer_type,
                user_id: task.user_id.clone(),
                result: DownloadResult::Failed,
                message: Some("boom".into()),
                completed_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(catalog.active_download_tasks().await.unwrap().is_empty());
        assert_eq!(
            catalog.download_task_status(task.id).await.unwrap(),
            Some(DownloadTaskStatus::Completed {
                result: DownloadResult::Failed,
                message: Some("boom".into())
            })
        );
        assert_eq!(
            catalog.download_task_status(Uuid::new_v4()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn archived_under_matches_whole_segments_only() {
        let catalog = memory_catalog().await;
        for (path, object_id) in [
            ("/c/a", "/c/a"),
            ("/c/b", "/cx/b"),
            ("/d/x", "/c/x"),
            ("/e/y", "/C/y"),
            ("/c", "/c"),
        ] {
            let mut object = record(path, UploadStatus::Archived);
            object.archive_location = Some(FileLocation::new("archive", object_id));
            catalog.insert_data_object(&object).await.unwrap();
        }

        let found = catalog.data_objects_archived_under("/c").await.unwrap();
        let paths: Vec<_> = found.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/c", "/c/a", "/d/x"]);
        assert_eq!(
            catalog.data_objects_archived_under("/c/").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn canceled_downloads_leave_the_polling_set() {
        let catalog = memory_catalog().await;
        let task = DataObjectDownloadTask {
            id: Uuid::new_v4(),
            path: "/p/a".into(),
            destination_location: FileLocation::new("endpoint", "/home/u/a"),
            transfer_type: TransferType::Globus,
            transfer_request_id: "req-1".into(),
            user_id: "u".into(),
            doc: "DOC".into(),
            completion_event: true,
            created_at: Utc::now(),
        };
        catalog.insert_download_task(&task).await.unwrap();

        assert!(catalog.request_download_cancellation(task.id).await.unwrap());
        assert!(!catalog.request_download_cancellation(Uuid::new_v4()).await.unwrap());
        assert!(catalog.active_download_tasks().await.unwrap().is_empty());
        let canceled = catalog.canceled_download_tasks().await.unwrap();
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].id, task.id);
        // Still active until the cancellation is completed.
        assert_eq!(
            catalog.download_task_status(task.id).await.unwrap(),
            Some(DownloadTaskStatus::InProgress)
        );
    }

    #[tokio::test]
    async fn collection_cancellation_survives_item_updates() {
        let catalog = memory_catalog().await;
        let mut task = CollectionDownloadTask::received_list(
            DownloadTaskKind::DataObjectList,
            vec!["/p/a".into(), "/q/b".into()],
            FileLocation::new("endpoint", "/dst"),
            "u".into(),
            "DOC".into(),
        );
        catalog.insert_collection_download_task(&task).await.unwrap();
        assert!(
            catalog
                .request_collection_download_cancellation(task.id)
                .await
                .unwrap()
        );

        // A pass holding the pre-cancel copy must not clear the flag.
        task.status = CollectionDownloadStatus::InProgress;
        catalog.update_collection_download_task(&task).await.unwrap();

        let stored = catalog
            .get_collection_download_task(task.id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.cancellation_requested);
        assert_eq!(stored.kind, DownloadTaskKind::DataObjectList);
        assert_eq!(stored.paths, vec!["/p/a", "/q/b"]);

        task.status = CollectionDownloadStatus::Completed;
        catalog.update_collection_download_task(&task).await.unwrap();
        assert!(
            !catalog
                .request_collection_download_cancellation(task.id)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn collection_task_items_keep_insertion_order() {
        let catalog = memory_catalog().await;
        let mut task = CollectionDownloadTask::received(
            "/p".into(),
            FileLocation::new("endpoint", "/dst"),
            "u".into(),
            "DOC".into(),
        );
        catalog.insert_collection_download_task(&task).await.unwrap();

        task.status = CollectionDownloadStatus::InProgress;
        task.items = vec![
            CollectionDownloadTaskItem::submitted(
                "/p/z".into(),
                FileLocation::new("endpoint", "/dst/z"),
                Uuid::new_v4(),
            ),
            CollectionDownloadTaskItem::failed(
                "/p/a".into(),
                FileLocation::new("endpoint", "/dst/a"),
                "nope".into(),
            ),
        ];
        catalog.update_collection_download_task(&task).await.unwrap();

        let in_progress = catalog
            .collection_download_tasks(CollectionDownloadStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].items, task.items);
        assert!(
            catalog
                .collection_download_tasks(CollectionDownloadStatus::Received)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
