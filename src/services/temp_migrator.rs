//! Second hop of staged uploads: temporary archive to permanent archive.

use crate::models::data_object::{
    DataObjectRecord, FileLocation, TransferType, UploadStatus, UploadTransition,
};
use crate::services::{
    backend::{BackendError, UploadRequest, UploadResponse, UploadSource},
    engine::{ServiceResult, TransferEngine},
    events::DomainEvent,
    sweep::{Outcome, SweepReport, run_sweep},
};
use chrono::Utc;
use tracing::{debug, error, info, warn};

impl TransferEngine {
    pub async fn migrate_from_temporary_archive(&self) -> SweepReport {
        let records = match self
            .catalog
            .data_objects_by_upload_status(&[UploadStatus::InTemporaryArchive])
            .await
        {
            Ok(records) => records,
            Err(err) => {
                error!(
                    "migrate_from_temporary_archive: listing staged uploads failed: {}",
                    err
                );
                return SweepReport::default();
            }
        };

        run_sweep(
            "migrate_from_temporary_archive",
            records,
            self.settings.max_concurrent_items,
            |record| self.migrate_staged_upload(record),
        )
        .await
    }

    async fn migrate_staged_upload(&self, record: DataObjectRecord) -> Outcome {
        let Some(_guard) = self.locks.try_lock(record.path.as_str()) else {
            debug!("{} is being processed by another pass", record.path);
            return Outcome::Skipped("path locked".into());
        };

        match self.archive_staged_file(&record).await {
            Ok(outcome) => outcome,
            Err(err) => self.demote_if_timed_out(&record, &err.to_string()).await,
        }
    }

    async fn archive_staged_file(&self, record: &DataObjectRecord) -> ServiceResult<Outcome> {
        let staged_location = record.archive_location.as_ref().ok_or_else(|| {
            BackendError::StagedFileNotFound(format!("{} has no staged location", record.path))
        })?;
        let staged = self
            .transfers
            .fetch_staged_file(TransferType::Temp, &staged_location.object_id)
            .await?;

        let permanent = self.settings.permanent_archive;
        let response = self
            .transfers
            .start_upload(
                permanent,
                UploadRequest {
                    source: UploadSource::File(staged.path.clone()),
                    path: record.path.clone(),
                    registrar_id: record.registrar_id.clone(),
                    caller_object_id: record.caller_object_id.clone(),
                    doc: record.doc.clone(),
                },
            )
            .await?;

        if !matches!(
            response.status,
            UploadStatus::Archived | UploadStatus::Failed
        ) {
            return Err(BackendError::Rejected(format!(
                "{} archive returned {} for a synchronous upload of {}",
                permanent, response.status, record.path
            ))
            .into());
        }

        Ok(self
            .persist_second_hop(record, &staged.location, permanent, response)
            .await)
    }

    /// Records the permanent archive's answer, then drops the staged copy. The
    /// staged copy outlives any catalog write that did not land.
    async fn persist_second_hop(
        &self,
        record: &DataObjectRecord,
        staged_location: &FileLocation,
        permanent: TransferType,
        response: UploadResponse,
    ) -> Outcome {
        let now = Utc::now();
        let archived = response.status == UploadStatus::Archived;
        let fields = UploadTransition {
            archive_location: archived.then(|| response.archive_location.clone()),
            transfer_request_id: Some(response.request_id.clone()),
            transfer_type: Some(permanent),
            checksum: response.checksum.clone(),
            completed_at: Some(now),
        };

        match self
            .catalog
            .transition_upload_status(
                &record.path,
                UploadStatus::InTemporaryArchive,
                response.status,
                &fields,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => return Outcome::Unchanged,
            Err(err) => {
                error!(
                    "{} archived to {} but its status could not be saved: {}",
                    record.path, permanent, err
                );
                return Outcome::Failed(err.to_string());
            }
        }

        if let Err(err) = self
            .transfers
            .delete_object(TransferType::Temp, staged_location, &record.doc)
            .await
        {
            warn!(
                "could not delete staged file {} of {}: {}",
                staged_location, record.path, err
            );
        }

        let event = if archived {
            info!(
                "{} moved from temporary archive to {}",
                record.path, response.archive_location
            );
            DomainEvent::UploadArchived {
                user_id: record.registrar_id.clone(),
                path: record.path.clone(),
                source_location: record.source_location.clone(),
                completed: now,
            }
        } else {
            error!("{} archive rejected staged upload of {}", permanent, record.path);
            DomainEvent::UploadFailed {
                user_id: record.registrar_id.clone(),
                path: record.path.clone(),
                source_location: record.source_location.clone(),
                message: format!("{} transfer failed.", permanent),
            }
        };
        self.emit(event).await;
        Outcome::Transitioned
    }
}
