//! Upload status reconciler: advances or demotes data objects whose upload is in flight.

use crate::models::data_object::{DataObjectRecord, UploadStatus, UploadTransition};
use crate::services::{
    backend::{BackendError, UploadReport},
    engine::TransferEngine,
    events::DomainEvent,
    sweep::{Outcome, SweepReport, run_sweep},
};
use chrono::Utc;
use tracing::{debug, error, info, warn};

const IN_FLIGHT: [UploadStatus; 2] = [
    UploadStatus::InProgressToArchive,
    UploadStatus::InProgressToTemporaryArchive,
];

impl TransferEngine {
    /// One pass over every upload still travelling to an archive.
    pub async fn reconcile_uploads(&self) -> SweepReport {
        let records = match self.catalog.data_objects_by_upload_status(&IN_FLIGHT).await {
            Ok(records) => records,
            Err(err) => {
                error!("reconcile_uploads: listing in-flight uploads failed: {}", err);
                return SweepReport::default();
            }
        };

        run_sweep(
            "reconcile_uploads",
            records,
            self.settings.max_concurrent_items,
            |record| self.reconcile_upload(record),
        )
        .await
    }

    async fn reconcile_upload(&self, record: DataObjectRecord) -> Outcome {
        let Some(_guard) = self.locks.try_lock(record.path.as_str()) else {
            debug!("{} is being processed by another pass", record.path);
            return Outcome::Skipped("path locked".into());
        };

        let report = match record.transfer_request_id.as_deref() {
            Some(request_id) => {
                self.transfers
                    .upload_status(record.transfer_type, request_id, &record.doc)
                    .await
            }
            None => Err(BackendError::RequestNotFound(record.path.clone())),
        };

        match report {
            Ok(report) => self.apply_upload_report(&record, report).await,
            Err(err) => self.demote_if_timed_out(&record, &err.to_string()).await,
        }
    }

    async fn apply_upload_report(&self, record: &DataObjectRecord, report: UploadReport) -> Outcome {
        let next = report.status;
        if !matches!(
            next,
            UploadStatus::Archived | UploadStatus::InTemporaryArchive | UploadStatus::Failed
        ) {
            debug!("upload of {} still in progress ({})", record.path, next);
            return Outcome::Unchanged;
        }
        if !record.upload_status.can_transition_to(next) {
            warn!(
                "backend reported {} for {} which is {}; ignoring",
                next, record.path, record.upload_status
            );
            return Outcome::Skipped(format!("unexpected status {}", next));
        }

        let now = Utc::now();
        let fields = match next {
            UploadStatus::Archived => UploadTransition {
                archive_location: report
                    .archive_location
                    .clone()
                    .or_else(|| record.archive_location.clone()),
                completed_at: Some(now),
                ..Default::default()
            },
            UploadStatus::InTemporaryArchive => UploadTransition {
                archive_location: report.archive_location.clone(),
                ..Default::default()
            },
            _ => UploadTransition::default(),
        };

        match self
            .catalog
            .transition_upload_status(&record.path, record.upload_status, next, &fields)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("{} moved on before this pass could update it", record.path);
                return Outcome::Unchanged;
            }
            Err(err) => {
                error!("failed to update upload status of {}: {}", record.path, err);
                return Outcome::Failed(err.to_string());
            }
        }
        info!("upload of {} is now {}", record.path, next);

        match next {
            UploadStatus::Archived => {
                self.emit(DomainEvent::UploadArchived {
                    user_id: record.registrar_id.clone(),
                    path: record.path.clone(),
                    source_location: record.source_location.clone(),
                    completed: now,
                })
                .await;
            }
            UploadStatus::InTemporaryArchive => {
                self.emit(DomainEvent::UploadInTempArchive {
                    user_id: record.registrar_id.clone(),
                    path: record.path.clone(),
                    source_location: record.source_location.clone(),
                })
                .await;
            }
            _ => {
                // Registration is rolled back.
                match self.catalog.delete_data_object(&record.path).await {
                    Ok(_) => info!("removed failed registration of {}", record.path),
                    Err(err) => error!(
                        "upload of {} failed but its record could not be removed: {}",
                        record.path, err
                    ),
                }
                self.emit(DomainEvent::UploadFailed {
                    user_id: record.registrar_id.clone(),
                    path: record.path.clone(),
                    source_location: record.source_location.clone(),
                    message: format!("{} transfer failed.", record.transfer_type),
                })
                .await;
            }
        }

        Outcome::Transitioned
    }
}

#[cfg(test)]
mod tests {
    use crate::models::data_object::{FileLocation, UploadStatus};
    use crate::services::{backend::UploadReport, catalog::Catalog};
    use crate::testing::{Harness, record};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn archived_upload_is_persisted_with_location_and_event() {
        let h = Harness::new().await;
        h.seed(&["/p"], &[record("/p/a", UploadStatus::InProgressToArchive)])
            .await;
        h.archive.set_upload_report(
            "req-/p/a",
            UploadReport::landed(UploadStatus::Archived, FileLocation::new("bucket", "/p/a")),
        );

        let report = h.engine.reconcile_uploads().await;
        assert_eq!(report.transitioned, 1);

        let stored = h.catalog.get_data_object("/p/a").await.unwrap().unwrap();
        assert_eq!(stored.upload_status, UploadStatus::Archived);
        assert_eq!(
            stored.archive_location,
            Some(FileLocation::new("bucket", "/p/a"))
        );
        assert!(stored.completed_at.is_some());
        assert_eq!(h.events.kinds(), vec!["UPLOAD_ARCHIVED"]);
    }

    #[tokio::test]
    async fn second_pass_over_archived_record_is_a_no_op() {
        let h = Harness::new().await;
        h.seed(&["/p"], &[record("/p/a", UploadStatus::InProgressToArchive)])
            .await;
        h.archive
            .set_upload_report("req-/p/a", UploadReport::new(UploadStatus::Archived));

        h.engine.reconcile_uploads().await;
        let before = h.catalog.get_data_object("/p/a").await.unwrap().unwrap();

        let report = h.engine.reconcile_uploads().await;
        assert_eq!(report.examined, 0);
        let after = h.catalog.get_data_object("/p/a").await.unwrap().unwrap();
        assert_eq!(after.completed_at, before.completed_at);
        assert_eq!(h.events.kinds(), vec!["UPLOAD_ARCHIVED"]);
    }

    #[tokio::test]
    async fn staged_upload_records_location_without_completion() {
        let h = Harness::new().await;
        h.seed(
            &["/p"],
            &[record("/p/a", UploadStatus::InProgressToTemporaryArchive)],
        )
        .await;
        h.archive.set_upload_report(
            "req-/p/a",
            UploadReport::landed(
                UploadStatus::InTemporaryArchive,
                FileLocation::new("temp", "/p/a"),
            ),
        );

        h.engine.reconcile_uploads().await;

        let stored = h.catalog.get_data_object("/p/a").await.unwrap().unwrap();
        assert_eq!(stored.upload_status, UploadStatus::InTemporaryArchive);
        assert_eq!(stored.archive_location, Some(FileLocation::new("temp", "/p/a")));
        assert!(stored.completed_at.is_none());
        assert_eq!(h.events.kinds(), vec!["UPLOAD_IN_TEMP_ARCHIVE"]);
    }

    #[tokio::test]
    async fn failed_upload_rolls_back_registration() {
        let h = Harness::new().await;
        h.seed(&["/p"], &[record("/p/a", UploadStatus::InProgressToArchive)])
            .await;
        h.archive
            .set_upload_report("req-/p/a", UploadReport::new(UploadStatus::Failed));

        h.engine.reconcile_uploads().await;

        assert!(h.catalog.get_data_object("/p/a").await.unwrap().is_none());
        assert_eq!(h.events.kinds(), vec!["UPLOAD_FAILED"]);
    }

    #[tokio::test]
    async fn in_progress_report_leaves_record_alone() {
        let h = Harness::new().await;
        h.seed(&["/p"], &[record("/p/a", UploadStatus::InProgressToArchive)])
            .await;
        h.archive.set_upload_report(
            "req-/p/a",
            UploadReport::new(UploadStatus::InProgressToArchive),
        );

        let report = h.engine.reconcile_uploads().await;
        assert_eq!(report.unchanged, 1);
        let stored = h.catalog.get_data_object("/p/a").await.unwrap().unwrap();
        assert_eq!(stored.upload_status, UploadStatus::InProgressToArchive);
        assert!(h.events.events().is_empty());
    }

    #[tokio::test]
    async fn unreachable_backend_demotes_only_stale_records() {
        let h = Harness::new().await;
        let mut stale = record("/p/old", UploadStatus::InProgressToArchive);
        stale.created_at = Utc::now() - Duration::days(2);
        let mut fresh = record("/p/new", UploadStatus::InProgressToArchive);
        fresh.created_at = Utc::now() - Duration::hours(1);
        h.seed(&["/p"], &[stale, fresh]).await;
        // No scripted reports: every status query errors.

        let report = h.engine.reconcile_uploads().await;
        assert_eq!(report.transitioned, 1);
        assert_eq!(report.failed, 1);

        let old = h.catalog.get_data_object("/p/old").await.unwrap().unwrap();
        assert_eq!(old.upload_status, UploadStatus::Unknown);
        let new = h.catalog.get_data_object("/p/new").await.unwrap().unwrap();
        assert_eq!(new.upload_status, UploadStatus::InProgressToArchive);
        assert!(h.events.events().is_empty());
    }

    #[tokio::test]
    async fn one_bad_record_does_not_stop_the_sweep() {
        let h = Harness::new().await;
        h.seed(
            &["/p"],
            &[
                record("/p/a", UploadStatus::InProgressToArchive),
                record("/p/b", UploadStatus::InProgressToArchive),
            ],
        )
        .await;
        h.archive
            .set_upload_report("req-/p/b", UploadReport::new(UploadStatus::Archived));

        let report = h.engine.reconcile_uploads().await;
        assert_eq!(report.examined, 2);
        let b = h.catalog.get_data_object("/p/b").await.unwrap().unwrap();
        assert_eq!(b.upload_status, UploadStatus::Archived);
    }

    #[tokio::test]
    async fn locked_path_is_skipped() {
        let h = Harness::new().await;
        h.seed(&["/p"], &[record("/p/a", UploadStatus::InProgressToArchive)])
            .await;
        h.archive
            .set_upload_report("req-/p/a", UploadReport::new(UploadStatus::Archived));

        let _held = h.engine.locks.try_lock("/p/a").unwrap();
        let report = h.engine.reconcile_uploads().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(h.archive.calls(), 0);
    }
}
