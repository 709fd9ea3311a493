//! Collection downloads: one request fanned out into per-object downloads, then
//! fanned back in once every child has a result. Lists of collections and lists of
//! data objects run through the same two passes.

use crate::models::{
    collection::final_segment,
    context::RequestContext,
    data_object::FileLocation,
    download::{
        CollectionDownloadStatus, CollectionDownloadTask, CollectionDownloadTaskItem,
        DownloadResult, DownloadTaskKind, DownloadTaskStatus,
    },
};
use crate::services::{
    catalog::CatalogResult,
    download_completer::CANCELED_MESSAGE,
    engine::{ServiceError, ServiceResult, TransferEngine},
    events::DomainEvent,
    sweep::{Outcome, SweepReport, run_sweep},
    traversal::{CollectionVisit, TraversalError, walk_collection},
};
use chrono::Utc;
use futures::{StreamExt, stream};
use std::{collections::HashSet, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// `base` with `segment` appended to its object id.
fn append_segment(base: &FileLocation, segment: &str) -> FileLocation {
    FileLocation::new(
        base.container_id.clone(),
        format!("{}/{}", base.object_id.trim_end_matches('/'), segment),
    )
}

/// Every data object of a walked subtree, with its destination under `root`.
fn subtree_targets(visits: &[CollectionVisit], root: &FileLocation) -> Vec<(String, FileLocation)> {
    visits
        .iter()
        .flat_map(|visit| {
            let node = visit
                .relative
                .iter()
                .fold(root.clone(), |dest, segment| append_segment(&dest, segment));
            visit.listing.data_objects.iter().map(move |path| {
                let destination = append_segment(&node, final_segment(path));
                (path.clone(), destination)
            })
        })
        .collect()
}

fn check_destination(destination: &FileLocation) -> ServiceResult<()> {
    if destination.container_id.is_empty() || destination.object_id.is_empty() {
        return Err(ServiceError::InvalidRequest(
            "download destination is incomplete".into(),
        ));
    }
    Ok(())
}

/// Trimmed, de-duplicated request paths. Blank entries and empty lists are rejected.
fn requested_paths(paths: &[String]) -> ServiceResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.trim();
        if path.is_empty() {
            return Err(ServiceError::InvalidRequest("empty path in download list".into()));
        }
        if seen.insert(path.to_string()) {
            unique.push(path.to_string());
        }
    }
    if unique.is_empty() {
        return Err(ServiceError::InvalidRequest("no paths to download".into()));
    }
    Ok(unique)
}

impl TransferEngine {
    /// Accept a collection download. Expansion happens on the next submission pass.
    pub async fn submit_collection_download(
        &self,
        ctx: &RequestContext,
        path: &str,
        destination: FileLocation,
    ) -> ServiceResult<Uuid> {
        if path.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("empty collection path".into()));
        }
        check_destination(&destination)?;
        if self.catalog.get_collection(path).await?.is_none() {
            return Err(ServiceError::NotFound(path.to_string()));
        }
        self.accept_download(ctx, DownloadTaskKind::Collection, vec![path.to_string()], destination)
            .await
    }

    /// Accept a download of several collections. Each lands under its own final
    /// segment inside `destination`.
    pub async fn submit_collections_download(
        &self,
        ctx: &RequestContext,
        paths: &[String],
        destination: FileLocation,
    ) -> ServiceResult<Uuid> {
        let paths = requested_paths(paths)?;
        check_destination(&destination)?;
        for path in &paths {
            if self.catalog.get_collection(path).await?.is_none() {
                return Err(ServiceError::NotFound(path.clone()));
            }
        }
        self.accept_download(ctx, DownloadTaskKind::CollectionList, paths, destination)
            .await
    }

    /// Accept a download of an explicit list of data objects.
    pub async fn submit_data_objects_download(
        &self,
        ctx: &RequestContext,
        paths: &[String],
        destination: FileLocation,
    ) -> ServiceResult<Uuid> {
        let paths = requested_paths(paths)?;
        check_destination(&destination)?;
        for path in &paths {
            if self.catalog.get_data_object(path).await?.is_none() {
                return Err(ServiceError::NotFound(path.clone()));
            }
        }
        self.accept_download(ctx, DownloadTaskKind::DataObjectList, paths, destination)
            .await
    }

    async fn accept_download(
        &self,
        ctx: &RequestContext,
        kind: DownloadTaskKind,
        paths: Vec<String>,
        destination: FileLocation,
    ) -> ServiceResult<Uuid> {
        let task = CollectionDownloadTask::received_list(
            kind,
            paths,
            destination,
            ctx.user_id.clone(),
            ctx.doc.clone(),
        );
        self.catalog.insert_collection_download_task(&task).await?;
        info!("{:?} download {} of {} received", kind, task.id, task.path);
        Ok(task.id)
    }

    pub async fn collection_download_task(&self, id: Uuid) -> ServiceResult<CollectionDownloadTask> {
        self.catalog
            .get_collection_download_task(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Ask for a collection download to stop. The submission or completion pass
    /// finishes it as CANCELED.
    pub async fn cancel_collection_download(
        &self,
        ctx: &RequestContext,
        id: Uuid,
    ) -> ServiceResult<()> {
        let task = self.collection_download_task(id).await?;
        if task.status.is_terminal()
            || !self.catalog.request_collection_download_cancellation(id).await?
        {
            return Err(ServiceError::InvalidRequest(format!(
                "collection download {} is already {}",
                id,
                task.status.as_str()
            )));
        }
        info!("collection download {} cancellation requested by {}", id, ctx.user_id);
        Ok(())
    }

    /// Submission pass: expand RECEIVED collection downloads into per-object downloads.
    pub async fn process_received_collection_downloads(&self) -> SweepReport {
        let tasks = match self
            .catalog
            .collection_download_tasks(CollectionDownloadStatus::Received)
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(
                    "process_received_collection_downloads: listing tasks failed: {}",
                    err
                );
                return SweepReport::default();
            }
        };

        run_sweep(
            "process_received_collection_downloads",
            tasks,
            self.settings.max_concurrent_items,
            |task| self.expand_collection_download(task),
        )
        .await
    }

    /// Data objects the task covers, each with its destination, in request order.
    async fn download_targets(
        &self,
        task: &CollectionDownloadTask,
    ) -> Result<Vec<(String, FileLocation)>, TraversalError> {
        let depth = self.settings.max_traversal_depth;
        let mut targets = Vec::new();
        for path in &task.paths {
            match task.kind {
                DownloadTaskKind::Collection => {
                    let visits = walk_collection(self.catalog.as_ref(), path, depth).await?;
                    targets.extend(subtree_targets(&visits, &task.destination_location));
                }
                DownloadTaskKind::CollectionList => {
                    let visits = walk_collection(self.catalog.as_ref(), path, depth).await?;
                    let root = append_segment(&task.destination_location, final_segment(path));
                    targets.extend(subtree_targets(&visits, &root));
                }
                DownloadTaskKind::DataObjectList => targets.push((
                    path.clone(),
                    append_segment(&task.destination_location, final_segment(path)),
                )),
            }
        }
        Ok(targets)
    }

    async fn expand_collection_download(&self, mut task: CollectionDownloadTask) -> Outcome {
        let Some(_guard) = self.locks.try_lock(format!("collection-download:{}", task.id)) else {
            return Outcome::Skipped("task locked".into());
        };

        if task.cancellation_requested {
            return self
                .finish_collection_download(
                    task,
                    CollectionDownloadStatus::Canceled,
                    Some(CANCELED_MESSAGE.into()),
                )
                .await;
        }

        let targets = match self.download_targets(&task).await {
            Ok(targets) => targets,
            Err(TraversalError::Catalog(err)) => {
                error!(
                    "collection download {}: reading {} failed: {}",
                    task.id, task.path, err
                );
                return Outcome::Failed(err.to_string());
            }
            Err(err) => {
                return self
                    .finish_collection_download(
                        task,
                        CollectionDownloadStatus::Failed,
                        Some(err.to_string()),
                    )
                    .await;
            }
        };

        if targets.is_empty() {
            return self
                .finish_collection_download(
                    task,
                    CollectionDownloadStatus::Failed,
                    Some("no data objects found".into()),
                )
                .await;
        }

        let ctx = RequestContext::new(task.user_id.clone(), task.doc.clone());
        let task_id = task.id;
        let ctx = &ctx;
        let items: Vec<CollectionDownloadTaskItem> = stream::iter(targets)
            .map(|(path, destination)| async move {
                match self
                    .submit_data_object_download(ctx, &path, destination.clone(), false)
                    .await
                {
                    Ok(submitted) => {
                        let mut item = CollectionDownloadTaskItem::submitted(
                            path,
                            submitted.destination_location,
                            submitted.task_id,
                        );
                        // Synchronous backends finish during submission.
                        if let DownloadTaskStatus::Completed { result, message } = submitted.status
                        {
                            item.result = Some(result);
                            item.message = message;
                        }
                        item
                    }
                    Err(err) => {
                        warn!(
                            "collection download {}: submitting {} failed: {}",
                            task_id, path, err
                        );
                        CollectionDownloadTaskItem::failed(path, destination, err.to_string())
                    }
                }
            })
            .buffered(self.settings.max_concurrent_items.max(1))
            .collect()
            .await;

        task.status = CollectionDownloadStatus::InProgress;
        task.items = items;
        if let Err(err) = self.save_expansion(&task).await {
            return self.abandon_expansion(task, err.to_string()).await;
        }
        info!(
            "collection download {} of {} in progress with {} items",
            task.id,
            task.path,
            task.items.len()
        );
        Outcome::Transitioned
    }

    /// Write the IN_PROGRESS move and its items in one transaction, retrying briefly.
    async fn save_expansion(&self, task: &CollectionDownloadTask) -> CatalogResult<()> {
        let mut attempt = 1;
        loop {
            match self.catalog.update_collection_download_task(task).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < SAVE_ATTEMPTS => {
                    warn!(
                        "collection download {}: saving {} items failed (attempt {}): {}",
                        task.id,
                        task.items.len(),
                        attempt,
                        err
                    );
                    tokio::time::sleep(SAVE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The children were submitted but could not be recorded. Cancel them so the
    /// task never holds unrecorded live downloads, then fail it.
    async fn abandon_expansion(&self, mut task: CollectionDownloadTask, cause: String) -> Outcome {
        let submitted = task.items.len();
        error!(
            "collection download {}: could not save {} items: {}",
            task.id, submitted, cause
        );
        for child in task
            .items
            .iter()
            .filter(|item| !item.is_resolved())
            .filter_map(|item| item.data_object_download_task_id)
        {
            if let Err(err) = self.catalog.request_download_cancellation(child).await {
                error!(
                    "collection download {}: could not cancel child {}: {}",
                    task.id, child, err
                );
            }
        }

        task.items.clear();
        self.finish_collection_download(
            task,
            CollectionDownloadStatus::Failed,
            Some(format!("could not record {} submitted items: {}", submitted, cause)),
        )
        .await
    }

    /// Persist a terminal status and notify the owner.
    async fn finish_collection_download(
        &self,
        mut task: CollectionDownloadTask,
        status: CollectionDownloadStatus,
        message: Option<String>,
    ) -> Outcome {
        let now = Utc::now();
        task.status = status;
        task.result = Some(status == CollectionDownloadStatus::Completed);
        task.message = message.clone();
        task.completed_at = Some(now);

        if let Err(err) = self.catalog.update_collection_download_task(&task).await {
            error!(
                "collection download {}: could not mark {}: {}",
                task.id,
                status.as_str(),
                err
            );
            return Outcome::Failed(err.to_string());
        }

        let user_id = task.user_id.clone();
        let path = task.path.clone();
        let destination = task.destination_location.clone();
        let event = match status {
            CollectionDownloadStatus::Failed => {
                warn!("collection download {} of {} failed: {:?}", task.id, path, message);
                DomainEvent::DownloadFailed {
                    user_id,
                    path,
                    task_id: task.id,
                    transfer_type: None,
                    destination,
                    completed: now,
                    message: message.unwrap_or_default(),
                }
            }
            CollectionDownloadStatus::Canceled => {
                info!("collection download {} of {} canceled", task.id, path);
                DomainEvent::DownloadCanceled {
                    user_id,
                    path,
                    task_id: task.id,
                    transfer_type: None,
                    destination,
                    completed: now,
                    message,
                }
            }
            _ => {
                info!(
                    "collection download {} of {} completed ({}/{} items)",
                    task.id,
                    path,
                    task.succeeded_items(),
                    task.items.len()
                );
                DomainEvent::DownloadCompleted {
                    user_id,
                    path,
                    task_id: task.id,
                    transfer_type: None,
                    destination,
                    completed: now,
                    message,
                }
            }
        };
        self.emit(event).await;
        Outcome::Transitioned
    }

    /// Completion pass: copy child results into IN_PROGRESS collection downloads.
    pub async fn complete_in_progress_collection_downloads(&self) -> SweepReport {
        let tasks = match self
            .catalog
            .collection_download_tasks(CollectionDownloadStatus::InProgress)
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(
                    "complete_in_progress_collection_downloads: listing tasks failed: {}",
                    err
                );
                return SweepReport::default();
            }
        };

        run_sweep(
            "complete_in_progress_collection_downloads",
            tasks,
            self.settings.max_concurrent_items,
            |task| self.aggregate_collection_download(task),
        )
        .await
    }

    async fn aggregate_collection_download(&self, mut task: CollectionDownloadTask) -> Outcome {
        let Some(_guard) = self.locks.try_lock(format!("collection-download:{}", task.id)) else {
            return Outcome::Skipped("task locked".into());
        };

        let mut changed = false;
        for item in task.items.iter_mut().filter(|item| !item.is_resolved()) {
            let Some(child) = item.data_object_download_task_id else {
                item.result = Some(DownloadResult::Failed);
                item.message = Some("download task status is unknown".into());
                changed = true;
                continue;
            };

            match self.catalog.download_task_status(child).await {
                Ok(Some(DownloadTaskStatus::Completed { result, message })) => {
                    item.result = Some(result);
                    item.message = message;
                    changed = true;
                }
                Ok(Some(DownloadTaskStatus::InProgress)) if task.cancellation_requested => {
                    if let Err(err) = self.catalog.request_download_cancellation(child).await {
                        error!(
                            "collection download {}: could not cancel child {}: {}",
                            task.id, child, err
                        );
                    }
                }
                Ok(Some(DownloadTaskStatus::InProgress)) => {}
                Ok(None) => {
                    warn!(
                        "collection download {}: child task {} of {} is unknown",
                        task.id, child, item.path
                    );
                    item.result = Some(DownloadResult::Failed);
                    item.message = Some("download task status is unknown".into());
                    changed = true;
                }
                Err(err) => {
                    error!(
                        "collection download {}: status of child {} failed: {}",
                        task.id, child, err
                    );
                }
            }
        }

        if !task.all_items_resolved() {
            if changed {
                if let Err(err) = self.catalog.update_collection_download_task(&task).await {
                    error!("collection download {}: could not save progress: {}", task.id, err);
                    return Outcome::Failed(err.to_string());
                }
            }
            debug!("collection download {} still in progress", task.id);
            return Outcome::Unchanged;
        }

        let total = task.items.len();
        let succeeded = task.succeeded_items();
        if task.cancellation_requested || task.canceled_items() > 0 {
            let message = format!(
                "{}. {} items downloaded successfully out of {}",
                CANCELED_MESSAGE, succeeded, total
            );
            return self
                .finish_collection_download(task, CollectionDownloadStatus::Canceled, Some(message))
                .await;
        }

        let message = (succeeded < total)
            .then(|| format!("{} items downloaded successfully out of {}", succeeded, total));
        self.finish_collection_download(task, CollectionDownloadStatus::Completed, message)
            .await
    }
}
