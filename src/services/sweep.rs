//! Per-item outcomes and the bounded sweep loop that aggregates them.

use futures::{StreamExt, stream};
use serde::Serialize;
use std::future::Future;
use tracing::info;

/// Result of processing one record or task in a sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// State moved forward and was persisted.
    Transitioned,
    /// Still in flight; nothing written.
    Unchanged,
    /// Not processed this pass (locked by another pass, ineligible).
    Skipped(String),
    /// Processing failed; the item is left for the next pass.
    Failed(String),
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub transitioned: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn record(&mut self, outcome: &Outcome) {
        self.examined += 1;
        match outcome {
            Outcome::Transitioned => self.transitioned += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }
}

impl FromIterator<Outcome> for SweepReport {
    fn from_iter<I: IntoIterator<Item = Outcome>>(iter: I) -> Self {
        let mut report = Self::default();
        for outcome in iter {
            report.record(&outcome);
        }
        report
    }
}

/// Run `work` over `items` with at most `limit` in flight. One item's failure never
/// stops the others.
pub async fn run_sweep<T, F, Fut>(name: &str, items: Vec<T>, limit: usize, work: F) -> SweepReport
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Outcome>,
{
    if items.is_empty() {
        return SweepReport::default();
    }

    let report: SweepReport = stream::iter(items)
        .map(work)
        .buffer_unordered(limit.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect();

    info!(
        "{}: examined={} transitioned={} unchanged={} skipped={} failed={}",
        name, report.examined, report.transitioned, report.unchanged, report.skipped, report.failed
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use std::time::Duration;

    #[tokio::test]
    async fn outcomes_are_tallied() {
        let report = run_sweep("test", vec![0, 1, 2, 3, 4], 2, |n| async move {
            match n {
                0 | 1 => Outcome::Transitioned,
                2 => Outcome::Unchanged,
                3 => Outcome::Skipped("locked".into()),
                _ => Outcome::Failed("boom".into()),
            }
        })
        .await;

        assert_eq!(
            report,
            SweepReport {
                examined: 5,
                transitioned: 2,
                unchanged: 1,
                skipped: 1,
                failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        run_sweep("test", (0..20).collect(), 3, |_| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Outcome::Unchanged
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
