use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flipscan_core::{CandidateListing, PriceBand, ReferencePrice, ReportRow, SearchTask};
use flipscan_storage::DedupStore;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    CandidateScanner, EngineError, FilterPipeline, Notifier, NotifyLatch, ReferencePriceEstimator,
    ReportSink, StopSignal,
};

#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    pub task_pause: Duration,
    /// Report every persisted candidate, not only the accepted ones.
    pub output_all: bool,
    /// Listings older than this are pruned at run start. Zero or less disables pruning.
    pub max_days_to_keep: i64,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            task_pause: Duration::from_secs(30),
            output_all: false,
            max_days_to_keep: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub tasks_skipped_recent: usize,
    pub tasks_unprofitable: usize,
    pub tasks_failed: usize,
    pub regions_failed: usize,
    pub candidates_found: usize,
    pub candidates_persisted: usize,
    pub candidates_reported: usize,
    pub notifications_sent: usize,
    pub pruned_rows: u64,
    pub stopped: bool,
}

impl RunSummary {
    fn new(started_at: DateTime<Utc>, tasks_total: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            tasks_total,
            tasks_completed: 0,
            tasks_skipped_recent: 0,
            tasks_unprofitable: 0,
            tasks_failed: 0,
            regions_failed: 0,
            candidates_found: 0,
            candidates_persisted: 0,
            candidates_reported: 0,
            notifications_sent: 0,
            pruned_rows: 0,
            stopped: false,
        }
    }

    fn absorb(&mut self, counts: &TaskCounts) {
        self.regions_failed += counts.regions_failed;
        self.candidates_found += counts.found;
        self.candidates_persisted += counts.persisted;
        self.candidates_reported += counts.reported;
        self.notifications_sent += counts.notified;
    }
}

#[derive(Debug, Default)]
struct TaskCounts {
    regions_failed: usize,
    found: usize,
    persisted: usize,
    reported: usize,
    notified: usize,
}

#[derive(Debug)]
enum TaskOutcome {
    SkippedRecent,
    Unprofitable,
    Scanned { counts: TaskCounts, interrupted: bool },
}

/// Runs search tasks one after another against a shared store.
pub struct TaskRunner {
    store: DedupStore,
    estimator: ReferencePriceEstimator,
    scanner: CandidateScanner,
    filters: FilterPipeline,
    report: ReportSink,
    notifier: Arc<dyn Notifier>,
    latch: NotifyLatch,
    options: RunnerOptions,
}

impl TaskRunner {
    pub fn new(
        store: DedupStore,
        estimator: ReferencePriceEstimator,
        scanner: CandidateScanner,
        filters: FilterPipeline,
        report: ReportSink,
        notifier: Arc<dyn Notifier>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            store,
            estimator,
            scanner,
            filters,
            report,
            notifier,
            latch: NotifyLatch::default(),
            options,
        }
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    pub async fn run(&self, tasks: &[SearchTask], stop: &mut StopSignal) -> RunSummary {
        let started_at = Utc::now();
        stop.begin_run(started_at);
        let mut summary = RunSummary::new(started_at, tasks.len());
        info!(run_id = %summary.run_id, tasks = tasks.len(), "run started");

        summary.pruned_rows = self.prune(started_at).await;

        for (index, task) in tasks.iter().enumerate() {
            if index > 0 && !self.options.task_pause.is_zero() {
                debug!(pause_secs = self.options.task_pause.as_secs(), "pausing between tasks");
                tokio::time::sleep(self.options.task_pause).await;
            }
            if stop.should_stop() {
                summary.stopped = true;
                break;
            }

            let span = info_span!("task", keyword = %task.keyword, index = index + 1, total = tasks.len());
            match self.run_task(task, stop).instrument(span).await {
                Ok(TaskOutcome::SkippedRecent) => summary.tasks_skipped_recent += 1,
                Ok(TaskOutcome::Unprofitable) => summary.tasks_unprofitable += 1,
                Ok(TaskOutcome::Scanned {
                    counts,
                    interrupted,
                }) => {
                    summary.absorb(&counts);
                    if interrupted {
                        summary.stopped = true;
                        break;
                    }
                    summary.tasks_completed += 1;
                }
                Err(err) => {
                    summary.tasks_failed += 1;
                    error!(keyword = %task.keyword, error = %err, "task failed");
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            completed = summary.tasks_completed,
            skipped = summary.tasks_skipped_recent,
            failed = summary.tasks_failed,
            regions_failed = summary.regions_failed,
            reported = summary.candidates_reported,
            stopped = summary.stopped,
            "run finished"
        );
        summary
    }

    async fn prune(&self, now: DateTime<Utc>) -> u64 {
        if self.options.max_days_to_keep <= 0 {
            return 0;
        }
        let cutoff = now - chrono::Duration::days(self.options.max_days_to_keep);
        match self.store.prune_listings_older_than(cutoff).await {
            Ok(pruned) => {
                if pruned > 0 {
                    info!(pruned, days = self.options.max_days_to_keep, "pruned old listings");
                }
                pruned
            }
            Err(err) => {
                warn!(error = %err, "could not prune old listings");
                0
            }
        }
    }

    async fn run_task(
        &self,
        task: &SearchTask,
        stop: &mut StopSignal,
    ) -> Result<TaskOutcome, EngineError> {
        let site = self.scanner.site();
        let keyword = task.keyword.as_str();

        if self
            .store
            .is_job_recent(site, keyword, task.freshness_window())
            .await?
        {
            info!(hours = task.hours_between_runs, "completed recently; skipping");
            return Ok(TaskOutcome::SkippedRecent);
        }

        let reference = self.estimator.estimate(task).await?;
        let Some(band) = PriceBand::for_task(task, reference) else {
            info!(reference_price = reference.value(), "no profitable price band");
            self.store.record_job_completion(site, keyword).await?;
            return Ok(TaskOutcome::Unprofitable);
        };

        let scan = self.scanner.scan_task(task, band, stop).await;
        let mut counts = TaskCounts {
            regions_failed: scan.failures.len(),
            found: scan.candidates.len(),
            ..Default::default()
        };

        for mut listing in scan.candidates {
            let verdict = self.filters.evaluate(task, &listing).await;
            listing.matches = verdict.matches;
            listing.metadata = verdict.metadata;

            match self.store.upsert_listing(&listing).await {
                Ok(()) => counts.persisted += 1,
                Err(err) => {
                    error!(external_id = %listing.external_id, error = %err, "could not persist listing")
                }
            }

            if listing.matches || self.options.output_all {
                self.report_listing(task, reference, &listing, &mut counts).await;
            }
        }

        if scan.interrupted {
            info!(regions = scan.regions_scanned, "task interrupted; not recording completion");
            return Ok(TaskOutcome::Scanned {
                counts,
                interrupted: true,
            });
        }

        self.store.record_job_completion(site, keyword).await?;
        info!(
            regions = scan.regions_scanned,
            regions_failed = counts.regions_failed,
            found = counts.found,
            reported = counts.reported,
            "task completed"
        );
        Ok(TaskOutcome::Scanned {
            counts,
            interrupted: false,
        })
    }

    async fn report_listing(
        &self,
        task: &SearchTask,
        reference: ReferencePrice,
        listing: &CandidateListing,
        counts: &mut TaskCounts,
    ) {
        let row = ReportRow::from_listing(task, reference, listing);
        match self.report.append(&row).await {
            Ok(path) => {
                counts.reported += 1;
                debug!(path = %path.display(), external_id = %listing.external_id, "reported");
            }
            Err(err) => warn!(error = %format!("{err:#}"), "could not append report row"),
        }

        if !self.latch.try_fire() {
            return;
        }
        let subject = format!("flipscan: new results for {}", task.keyword);
        let body = format!(
            "{} for ${} (reference ${reference})\n{}",
            listing.title, listing.price, listing.url
        );
        match self.notifier.notify(&subject, &body).await {
            Ok(()) => counts.notified += 1,
            Err(err) => warn!(error = %format!("{err:#}"), "notification failed"),
        }
    }
}
