//! Tiering (deep archive) and migration submission.
//!
//! Every precondition is checked before the backend is called. The only durable
//! effect of a tier request is `deep_archive_status = IN_PROGRESS` on each affected
//! object; completion is observed elsewhere.

use crate::models::{
    context::RequestContext,
    data_object::{DataObjectRecord, DeepArchiveStatus, FileLocation, TransferType, UploadStatus},
    tiering::{
        BulkTierItem, BulkTierRequest, DataMigrationTask, MigrationRequest, MigrationResponse,
        MigrationStatus, TierRequest, TierResponse, TierSubmission,
    },
};
use crate::services::{
    engine::{ServiceError, ServiceResult, TransferEngine},
    traversal::{TraversalError, walk_collection},
};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

/// An object cleared for tiering.
struct TierCandidate {
    path: String,
    transfer_type: TransferType,
    item: BulkTierItem,
}

/// Group candidates by backend, keeping first-seen order.
fn group_by_backend(candidates: &[TierCandidate]) -> Vec<(TransferType, BulkTierRequest)> {
    let mut groups: Vec<(TransferType, BulkTierRequest)> = Vec::new();
    for candidate in candidates {
        match groups
            .iter_mut()
            .find(|(kind, _)| *kind == candidate.transfer_type)
        {
            Some((_, request)) => request.items.push(candidate.item.clone()),
            None => groups.push((
                candidate.transfer_type,
                BulkTierRequest {
                    items: vec![candidate.item.clone()],
                },
            )),
        }
    }
    groups
}

/// Whether `path` is `collection` itself or lies beneath it, compared by segment.
fn is_under(path: &str, collection: &str) -> bool {
    let collection = collection.trim_end_matches('/');
    if collection.is_empty() {
        return path.starts_with('/');
    }
    path == collection
        || path
            .strip_prefix(collection)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn dedup(paths: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    paths
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty() && seen.insert(p.clone()))
        .collect()
}

impl TransferEngine {
    fn tier_supported(&self, record: &DataObjectRecord) -> bool {
        self.transfers.tier_supported(
            &record.configuration_id,
            record.s3_archive_configuration_id.as_deref(),
            record.transfer_type,
        )
    }

    /// Link, archive status and capability checks shared by every tier entry point.
    fn check_tierable(&self, record: &DataObjectRecord) -> ServiceResult<FileLocation> {
        if record.is_link() {
            return Err(ServiceError::IsLink(record.path.clone()));
        }
        let location = match (&record.upload_status, &record.archive_location) {
            (UploadStatus::Archived, Some(location)) => location.clone(),
            _ => return Err(ServiceError::FileNotArchived(record.path.clone())),
        };
        if !self.tier_supported(record) {
            return Err(ServiceError::NotSupported(record.path.clone()));
        }
        Ok(location)
    }

    fn candidate(record: &DataObjectRecord, location: FileLocation) -> TierCandidate {
        TierCandidate {
            path: record.path.clone(),
            transfer_type: record.transfer_type,
            item: BulkTierItem {
                path: location.object_id,
                configuration_id: record.configuration_id.clone(),
            },
        }
    }

    /// Reject a collection whose archive prefix also holds objects registered
    /// under some other collection.
    async fn check_archive_exclusive(&self, collection: &str) -> ServiceResult<()> {
        let archived = self.catalog.data_objects_archived_under(collection).await?;
        match archived.into_iter().find(|r| !is_under(&r.path, collection)) {
            Some(stray) => Err(ServiceError::InvalidArchiveLayout {
                path: stray.path,
                collection: collection.to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn load_object(&self, path: &str) -> ServiceResult<DataObjectRecord> {
        self.catalog
            .get_data_object(path)
            .await?
            .ok_or_else(|| ServiceError::NotFound(path.to_string()))
    }

    /// Submit the grouped bulk requests, then mark every path in progress.
    async fn submit_bulk(&self, candidates: &[TierCandidate]) -> ServiceResult<Vec<String>> {
        for (kind, request) in group_by_backend(candidates) {
            info!("submitting {} items for tiering on {}", request.items.len(), kind);
            self.transfers
                .submit_tier(kind, TierSubmission::Bulk(request))
                .await?;
        }
        self.mark_tiering(candidates.iter().map(|c| c.path.as_str()))
            .await
    }

    async fn mark_tiering<'a>(
        &self,
        paths: impl Iterator<Item = &'a str>,
    ) -> ServiceResult<Vec<String>> {
        let now = Utc::now();
        let mut marked = Vec::new();
        for path in paths {
            self.catalog
                .set_deep_archive_status(path, DeepArchiveStatus::InProgress, now)
                .await?;
            marked.push(path.to_string());
        }
        Ok(marked)
    }

    pub async fn tier_data_object(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> ServiceResult<TierResponse> {
        if path.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("empty data object path".into()));
        }
        let record = self.load_object(path).await?;
        let location = self.check_tierable(&record)?;

        let candidate = Self::candidate(&record, location);
        self.transfers
            .submit_tier(
                candidate.transfer_type,
                TierSubmission::Single(candidate.item.clone()),
            )
            .await?;
        let tiered_paths = self.mark_tiering(std::iter::once(path)).await?;
        info!("{} submitted for tiering by {}", path, ctx.user_id);

        Ok(TierResponse {
            tiered_paths,
            skipped: Vec::new(),
        })
    }

    pub async fn tier_collection(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> ServiceResult<TierResponse> {
        if path.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("empty collection path".into()));
        }
        let visits = walk_collection(self.catalog.as_ref(), path, self.settings.max_traversal_depth)
            .await
            .map_err(|err| match err {
                TraversalError::RootNotFound(root) => ServiceError::NotFound(root),
                other => other.into(),
            })?;
        self.check_archive_exclusive(path).await?;

        let mut candidates = Vec::new();
        let mut unsupported = Vec::new();
        for visit in &visits {
            for object_path in &visit.listing.data_objects {
                let Some(record) = self.catalog.get_data_object(object_path).await? else {
                    continue;
                };
                match self.check_tierable(&record) {
                    Ok(location) => {
                        if !is_under(&location.object_id, &visit.listing.path) {
                            return Err(ServiceError::InvalidArchiveLayout {
                                path: record.path.clone(),
                                collection: visit.listing.path.clone(),
                            });
                        }
                        candidates.push(Self::candidate(&record, location));
                    }
                    Err(ServiceError::NotSupported(p)) => {
                        warn!("{} skipped: tiering not supported for its configuration", p);
                        unsupported.push(p);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if candidates.is_empty() {
            return Err(if unsupported.is_empty() {
                ServiceError::NoDataObjects(path.to_string())
            } else {
                ServiceError::NotSupported(path.to_string())
            });
        }

        let tiered_paths = self.submit_bulk(&candidates).await?;
        info!(
            "{} objects under {} submitted for tiering by {}",
            tiered_paths.len(),
            path,
            ctx.user_id
        );
        Ok(TierResponse {
            tiered_paths,
            skipped: unsupported
                .into_iter()
                .map(|p| (p, "tiering not supported".to_string()))
                .collect(),
        })
    }

    /// Bulk tiering of either data objects or collections (never both). Ineligible
    /// items are skipped; the rest go out in one request per backend.
    pub async fn tier_data_objects_or_collections(
        &self,
        ctx: &RequestContext,
        request: &TierRequest,
    ) -> ServiceResult<TierResponse> {
        let objects = dedup(&request.data_object_paths);
        let collections = dedup(&request.collection_paths);
        if objects.is_empty() == collections.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "exactly one of data object paths or collection paths must be provided".into(),
            ));
        }

        let mut records = Vec::new();
        for path in &objects {
            records.push((self.load_object(path).await?, None));
        }
        for collection in &collections {
            let visits = walk_collection(
                self.catalog.as_ref(),
                collection,
                self.settings.max_traversal_depth,
            )
            .await
            .map_err(|err| match err {
                TraversalError::RootNotFound(root) => ServiceError::NotFound(root),
                other => other.into(),
            })?;
            self.check_archive_exclusive(collection).await?;
            for visit in visits {
                for object_path in &visit.listing.data_objects {
                    if let Some(record) = self.catalog.get_data_object(object_path).await? {
                        records.push((record, Some(visit.listing.path.clone())));
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut skipped = Vec::new();
        for (record, collection) in records {
            if !seen.insert(record.path.clone()) {
                continue;
            }
            match self.check_tierable(&record) {
                Ok(location) => match collection {
                    Some(collection) if !is_under(&location.object_id, &collection) => {
                        warn!("{} skipped: archived outside {}", record.path, collection);
                        skipped.push((record.path, "INVALID_ARCHIVE_LAYOUT".to_string()));
                    }
                    _ => candidates.push(Self::candidate(&record, location)),
                },
                Err(err) => {
                    warn!("{} skipped from bulk tiering: {}", record.path, err);
                    skipped.push((record.path, err.reason().to_string()));
                }
            }
        }

        if candidates.is_empty() {
            return Err(ServiceError::NoDataObjects(
                "no eligible data objects in request".into(),
            ));
        }

        let tiered_paths = self.submit_bulk(&candidates).await?;
        info!(
            "bulk tiering by {}: {} submitted, {} skipped",
            ctx.user_id,
            tiered_paths.len(),
            skipped.len()
        );
        Ok(TierResponse {
            tiered_paths,
            skipped,
        })
    }

    /// Queue a migration of `path` to another backend configuration.
    pub async fn migrate_data_object(
        &self,
        ctx: &RequestContext,
        path: &str,
        request: &MigrationRequest,
    ) -> ServiceResult<MigrationResponse> {
        if path.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("empty data object path".into()));
        }
        let target = request.s3_archive_configuration_id.trim();
        if target.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "no target archive configuration".into(),
            ));
        }
        if !self.transfers.tiering().has_archive_configuration(target) {
            return Err(ServiceError::InvalidRequest(format!(
                "unknown archive configuration `{}`",
                target
            )));
        }

        let record = self.load_object(path).await?;
        if record.is_link() {
            return Err(ServiceError::IsLink(path.to_string()));
        }
        if record.upload_status != UploadStatus::Archived {
            return Err(ServiceError::FileNotArchived(path.to_string()));
        }
        if !matches!(record.transfer_type, TransferType::S3 | TransferType::Posix) {
            return Err(ServiceError::NotSupported(path.to_string()));
        }

        let task = DataMigrationTask {
            id: Uuid::new_v4(),
            path: path.to_string(),
            user_id: ctx.user_id.clone(),
            configuration_id: record.configuration_id.clone(),
            from_s3_archive_configuration_id: record.s3_archive_configuration_id.clone(),
            to_s3_archive_configuration_id: target.to_string(),
            transfer_type: record.transfer_type,
            status: MigrationStatus::Received,
            created_at: Utc::now(),
        };
        self.catalog.insert_migration_task(&task).await?;
        info!("migration {} of {} to {} received", task.id, path, target);

        Ok(MigrationResponse { task_id: task.id })
    }
}
