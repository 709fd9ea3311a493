//! Data-object downloads: submission, status queries and completion of the
//! asynchronous second hop (backend to user endpoint).

use crate::models::{
    context::RequestContext,
    data_object::{FileLocation, TransferType, UploadStatus},
    download::{
        DataObjectDownloadTask, DownloadResult, DownloadSubmission, DownloadTaskResult,
        DownloadTaskStatus,
    },
};
use crate::services::{
    backend::{DownloadReport, DownloadRequest, DownloadStatus},
    engine::{ServiceError, ServiceResult, TransferEngine},
    events::DomainEvent,
    sweep::{Outcome, SweepReport, run_sweep},
};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(crate) const CANCELED_MESSAGE: &str = "Download request canceled";

fn failure_message(kind: TransferType, report: &DownloadReport) -> String {
    format!(
        "{} transfer failed [{}].",
        kind,
        report.message.as_deref().unwrap_or("no details reported")
    )
}

fn download_event(result: &DownloadTaskResult) -> DomainEvent {
    match result.result {
        DownloadResult::Completed => DomainEvent::DownloadCompleted {
            user_id: result.user_id.clone(),
            path: result.path.clone(),
            task_id: result.id,
            transfer_type: Some(result.transfer_type),
            destination: result.destination_location.clone(),
            completed: result.completed_at,
            message: None,
        },
        DownloadResult::Failed => DomainEvent::DownloadFailed {
            user_id: result.user_id.clone(),
            path: result.path.clone(),
            task_id: result.id,
            transfer_type: Some(result.transfer_type),
            destination: result.destination_location.clone(),
            completed: result.completed_at,
            message: result.message.clone().unwrap_or_default(),
        },
        DownloadResult::Canceled => DomainEvent::DownloadCanceled {
            user_id: result.user_id.clone(),
            path: result.path.clone(),
            task_id: result.id,
            transfer_type: Some(result.transfer_type),
            destination: result.destination_location.clone(),
            completed: result.completed_at,
            message: result.message.clone(),
        },
    }
}

fn report_result(status: DownloadStatus) -> DownloadResult {
    match status {
        DownloadStatus::Completed => DownloadResult::Completed,
        _ => DownloadResult::Failed,
    }
}

impl TransferEngine {
    /// Start downloading `path` to `destination`.
    ///
    /// Downloads through a backend with an asynchronous second hop enter the active
    /// set and are finished by [`TransferEngine::complete_downloads`]; all others are
    /// recorded as complete straight away.
    pub async fn submit_data_object_download(
        &self,
        ctx: &RequestContext,
        path: &str,
        destination: FileLocation,
        completion_event: bool,
    ) -> ServiceResult<DownloadSubmission> {
        if path.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("empty data object path".into()));
        }
        if destination.container_id.is_empty() || destination.object_id.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "download destination is incomplete".into(),
            ));
        }

        let mut record = self
            .catalog
            .get_data_object(path)
            .await?
            .ok_or_else(|| ServiceError::NotFound(path.to_string()))?;
        if let Some(source) = record.link_source_path.clone().filter(|s| !s.is_empty()) {
            record = self
                .catalog
                .get_data_object(&source)
                .await?
                .ok_or(ServiceError::NotFound(source))?;
        }

        if record.upload_status != UploadStatus::Archived {
            return Err(ServiceError::FileNotArchived(path.to_string()));
        }
        let archive_location = record
            .archive_location
            .clone()
            .ok_or_else(|| ServiceError::FileNotArchived(path.to_string()))?;

        let kind = record.transfer_type;
        let started = self
            .transfers
            .start_download(
                kind,
                DownloadRequest {
                    archive_location,
                    destination: destination.clone(),
                    doc: ctx.doc.clone(),
                },
            )
            .await?;

        let task_id = Uuid::new_v4();
        if started.report.status == DownloadStatus::InProgress {
            self.catalog
                .insert_download_task(&DataObjectDownloadTask {
                    id: task_id,
                    path: path.to_string(),
                    destination_location: destination.clone(),
                    transfer_type: kind,
                    transfer_request_id: started.request_id,
                    user_id: ctx.user_id.clone(),
                    doc: ctx.doc.clone(),
                    completion_event,
                    created_at: Utc::now(),
                })
                .await?;
            info!("download {} of {} submitted to {}", task_id, path, kind);

            return Ok(DownloadSubmission {
                task_id,
                destination_location: destination,
                status: DownloadTaskStatus::InProgress,
            });
        }

        let result = DownloadTaskResult {
            id: task_id,
            path: path.to_string(),
            destination_location: destination.clone(),
            transfer_type: kind,
            user_id: ctx.user_id.clone(),
            result: report_result(started.report.status),
            message: (started.report.status == DownloadStatus::Failed)
                .then(|| failure_message(kind, &started.report)),
            completed_at: Utc::now(),
        };
        self.catalog.complete_download_task(&result).await?;
        info!(
            "download {} of {} finished synchronously (result={:?})",
            task_id, path, result.result
        );
        if completion_event {
            self.emit(download_event(&result)).await;
        }

        Ok(DownloadSubmission {
            task_id,
            destination_location: destination,
            status: DownloadTaskStatus::Completed {
                result: result.result,
                message: result.message,
            },
        })
    }

    pub async fn download_task_status(&self, task_id: Uuid) -> ServiceResult<DownloadTaskStatus> {
        self.catalog
            .download_task_status(task_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(task_id.to_string()))
    }

    pub async fn complete_downloads(&self) -> SweepReport {
        let tasks = match self.catalog.active_download_tasks().await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!("complete_downloads: listing active downloads failed: {}", err);
                return SweepReport::default();
            }
        };

        run_sweep(
            "complete_downloads",
            tasks,
            self.settings.max_concurrent_items,
            |task| self.complete_download(task),
        )
        .await
    }

    async fn complete_download(&self, task: DataObjectDownloadTask) -> Outcome {
        let Some(_guard) = self.locks.try_lock(format!("download:{}", task.id)) else {
            return Outcome::Skipped("task locked".into());
        };

        let report = match self
            .transfers
            .download_status(task.transfer_type, &task.transfer_request_id, &task.doc)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                error!(
                    "download {} of {}: status query failed: {}",
                    task.id, task.path, err
                );
                return Outcome::Failed(err.to_string());
            }
        };

        if report.status == DownloadStatus::InProgress {
            debug!("download {} of {} still in progress", task.id, task.path);
            return Outcome::Unchanged;
        }

        let result = report_result(report.status);
        let message = (result == DownloadResult::Failed)
            .then(|| failure_message(task.transfer_type, &report));
        self.finish_download(&task, result, message).await
    }

    /// Move `task` to the history set with `result`, notifying if it asked to be.
    async fn finish_download(
        &self,
        task: &DataObjectDownloadTask,
        result: DownloadResult,
        message: Option<String>,
    ) -> Outcome {
        let result = DownloadTaskResult {
            id: task.id,
            path: task.path.clone(),
            destination_location: task.destination_location.clone(),
            transfer_type: task.transfer_type,
            user_id: task.user_id.clone(),
            result,
            message,
            completed_at: Utc::now(),
        };

        if let Err(err) = self.catalog.complete_download_task(&result).await {
            error!("download {}: could not record completion: {}", task.id, err);
            return Outcome::Failed(err.to_string());
        }
        info!(
            "download {} of {} completed (result={:?})",
            task.id, task.path, result.result
        );

        if task.completion_event {
            self.emit(download_event(&result)).await;
        }
        Outcome::Transitioned
    }

    /// Ask for an in-flight download to be canceled. The cancellation sweep moves
    /// it to the history set.
    pub async fn cancel_data_object_download(
        &self,
        ctx: &RequestContext,
        task_id: Uuid,
    ) -> ServiceResult<()> {
        if self.catalog.request_download_cancellation(task_id).await? {
            info!("download {} cancellation requested by {}", task_id, ctx.user_id);
            return Ok(());
        }
        match self.catalog.download_task_status(task_id).await? {
            Some(_) => Err(ServiceError::InvalidRequest(format!(
                "download {} is not in progress",
                task_id
            ))),
            None => Err(ServiceError::NotFound(task_id.to_string())),
        }
    }

    /// Cancellation pass: complete every active download whose owner canceled it.
    pub async fn complete_canceled_downloads(&self) -> SweepReport {
        let tasks = match self.catalog.canceled_download_tasks().await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(
                    "complete_canceled_downloads: listing canceled downloads failed: {}",
                    err
                );
                return SweepReport::default();
            }
        };

        run_sweep(
            "complete_canceled_downloads",
            tasks,
            self.settings.max_concurrent_items,
            |task| self.complete_canceled_download(task),
        )
        .await
    }

    async fn complete_canceled_download(&self, task: DataObjectDownloadTask) -> Outcome {
        let Some(_guard) = self.locks.try_lock(format!("download:{}", task.id)) else {
            return Outcome::Skipped("task locked".into());
        };
        warn!("download {} of {} canceled", task.id, task.path);
        self.finish_download(&task, DownloadResult::Canceled, Some(CANCELED_MESSAGE.into()))
            .await
    }
}
