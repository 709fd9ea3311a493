//! Fixed-cadence driver for the engine's sweeps, plus a record of when each one
//! last finished.

use crate::services::{engine::TransferEngine, sweep::SweepReport};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

/// A sweep that has not finished a pass in this many intervals counts as stalled.
const STALL_INTERVALS: u32 = 5;
const MIN_STALL_AFTER: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sweep {
    ReconcileUploads,
    MigrateFromTemporaryArchive,
    CompleteDownloads,
    CompleteCanceledDownloads,
    ProcessReceivedCollectionDownloads,
    CompleteInProgressCollectionDownloads,
}

impl Sweep {
    pub const ALL: [Sweep; 6] = [
        Sweep::ReconcileUploads,
        Sweep::MigrateFromTemporaryArchive,
        Sweep::CompleteDownloads,
        Sweep::CompleteCanceledDownloads,
        Sweep::ProcessReceivedCollectionDownloads,
        Sweep::CompleteInProgressCollectionDownloads,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReconcileUploads => "reconcile_uploads",
            Self::MigrateFromTemporaryArchive => "migrate_from_temporary_archive",
            Self::CompleteDownloads => "complete_downloads",
            Self::CompleteCanceledDownloads => "complete_canceled_downloads",
            Self::ProcessReceivedCollectionDownloads => "process_received_collection_downloads",
            Self::CompleteInProgressCollectionDownloads => {
                "complete_in_progress_collection_downloads"
            }
        }
    }

    pub async fn run(&self, engine: &TransferEngine) -> SweepReport {
        match self {
            Self::ReconcileUploads => engine.reconcile_uploads().await,
            Self::MigrateFromTemporaryArchive => engine.migrate_from_temporary_archive().await,
            Self::CompleteDownloads => engine.complete_downloads().await,
            Self::CompleteCanceledDownloads => engine.complete_canceled_downloads().await,
            Self::ProcessReceivedCollectionDownloads => {
                engine.process_received_collection_downloads().await
            }
            Self::CompleteInProgressCollectionDownloads => {
                engine.complete_in_progress_collection_downloads().await
            }
        }
    }
}

/// The most recent finished pass of one sweep.
#[derive(Serialize, Clone, Copy, Debug)]
pub struct SweepRun {
    pub finished_at: DateTime<Utc>,
    pub report: SweepReport,
}

/// Readiness view of one sweep.
#[derive(Serialize, Clone, Debug)]
pub struct SweepHealth {
    pub name: &'static str,
    pub last_run: Option<SweepRun>,
    pub stalled: bool,
}

/// Last finished pass per sweep, shared between the sweep loops and readiness checks.
pub struct SweepMonitor {
    started_at: DateTime<Utc>,
    stall_after: Duration,
    runs: DashMap<&'static str, SweepRun>,
}

impl SweepMonitor {
    pub fn new(every: Duration) -> Self {
        Self::with_stall_after((every * STALL_INTERVALS).max(MIN_STALL_AFTER))
    }

    pub fn with_stall_after(stall_after: Duration) -> Self {
        Self {
            started_at: Utc::now(),
            stall_after,
            runs: DashMap::new(),
        }
    }

    pub fn record(&self, sweep: Sweep, report: SweepReport) {
        self.runs.insert(
            sweep.name(),
            SweepRun {
                finished_at: Utc::now(),
                report,
            },
        );
    }

    /// Every sweep in [`Sweep::ALL`] order. A sweep that never ran is measured from
    /// the monitor's creation.
    pub fn snapshot(&self) -> Vec<SweepHealth> {
        let now = Utc::now();
        Sweep::ALL
            .iter()
            .map(|sweep| {
                let last_run = self.runs.get(sweep.name()).map(|run| *run);
                let since = last_run.map_or(self.started_at, |run| run.finished_at);
                let idle = (now - since).to_std().unwrap_or_default();
                SweepHealth {
                    name: sweep.name(),
                    last_run,
                    stalled: idle > self.stall_after,
                }
            })
            .collect()
    }
}

/// Spawn one interval loop per sweep. A pass that overruns its tick delays the next
/// one instead of stacking up behind it.
pub fn spawn_sweeps(
    engine: Arc<TransferEngine>,
    every: Duration,
    monitor: Arc<SweepMonitor>,
) -> Vec<JoinHandle<()>> {
    Sweep::ALL
        .into_iter()
        .map(|sweep| {
            let engine = Arc::clone(&engine);
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let report = sweep.run(&engine).await;
                    if report.examined == 0 {
                        debug!("{}: nothing to do", sweep.name());
                    } else if report.failed > 0 {
                        warn!(
                            "{}: {} of {} items failed",
                            sweep.name(),
                            report.failed,
                            report.examined
                        );
                    }
                    monitor.record(sweep, report);
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::data_object::{FileLocation, UploadStatus};
    use crate::services::{backend::UploadReport, catalog::Catalog};
    use crate::testing::{Harness, record};

    #[tokio::test]
    async fn spawned_sweeps_drive_records_forward() {
        let h = Harness::new().await;
        h.seed(&["/p"], &[record("/p/a", UploadStatus::InProgressToArchive)])
            .await;
        h.archive.set_upload_report(
            "req-/p/a",
            UploadReport::landed(UploadStatus::Archived, FileLocation::new("bucket", "/p/a")),
        );

        let catalog = h.catalog.clone();
        let monitor = Arc::new(SweepMonitor::new(Duration::from_millis(10)));
        let handles = spawn_sweeps(
            Arc::new(h.engine),
            Duration::from_millis(10),
            Arc::clone(&monitor),
        );

        let mut archived = false;
        for _ in 0..100 {
            let stored = catalog.get_data_object("/p/a").await.unwrap().unwrap();
            if stored.upload_status == UploadStatus::Archived {
                archived = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.abort();
        }
        assert!(archived);

        let reconcile = monitor
            .snapshot()
            .into_iter()
            .find(|s| s.name == "reconcile_uploads")
            .unwrap();
        assert!(reconcile.last_run.is_some());
        assert!(!reconcile.stalled);
    }

    #[tokio::test]
    async fn silent_sweep_is_reported_stalled() {
        let monitor = SweepMonitor::with_stall_after(Duration::ZERO);
        monitor.record(Sweep::CompleteDownloads, SweepReport::default());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.len(), Sweep::ALL.len());
        assert!(snapshot.iter().all(|s| s.stalled));
        let downloads = snapshot
            .iter()
            .find(|s| s.name == "complete_downloads")
            .unwrap();
        assert!(downloads.last_run.is_some());

        let fresh = SweepMonitor::new(Duration::from_secs(1));
        assert!(fresh.snapshot().iter().all(|s| !s.stalled && s.last_run.is_none()));
    }

    #[test]
    fn every_sweep_has_a_distinct_name() {
        let names: std::collections::HashSet<_> = Sweep::ALL.iter().map(Sweep::name).collect();
        assert_eq!(names.len(), Sweep::ALL.len());
    }
}
