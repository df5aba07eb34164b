//! Drives the configured datasets: one sweep for `sync`, one interval loop per
//! dataset for `watch`. Every run goes through [`BoundedTaskRunner`] so a hung
//! archive or collaborator never outlives its deadline.

use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::runner::{BoundedTaskRunner, RunnerOutcome};
use crate::workflow::{RunOutcome, SyncWorkflow, WorkflowError};

/// A workflow plus how often and how long it may run.
#[derive(Clone)]
pub struct ScheduledDataset {
    pub workflow: SyncWorkflow,
    pub interval: Duration,
    pub deadline: Duration,
}

/// How a single bounded run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReport {
    Committed,
    UpToDate,
    Skipped,
    Failed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub committed: usize,
    pub up_to_date: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl SweepSummary {
    fn record(&mut self, report: RunReport) {
        match report {
            RunReport::Committed => self.committed += 1,
            RunReport::UpToDate => self.up_to_date += 1,
            RunReport::Skipped => self.skipped += 1,
            RunReport::Failed => self.failed += 1,
            RunReport::TimedOut => self.timed_out += 1,
            RunReport::Cancelled => self.cancelled += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.timed_out > 0
    }
}

pub struct Scheduler {
    datasets: Vec<ScheduledDataset>,
    runner: BoundedTaskRunner,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(datasets: Vec<ScheduledDataset>, shutdown: CancellationToken) -> Self {
        Self {
            datasets,
            runner: BoundedTaskRunner::new(shutdown.clone()),
            shutdown,
        }
    }

    /// Run every dataset once, concurrently, and wait for all of them.
    pub async fn run_once(&self) -> SweepSummary {
        let reports = join_all(
            self.datasets
                .iter()
                .map(|ds| run_bounded(&self.runner, ds)),
        )
        .await;

        let mut summary = SweepSummary::default();
        for report in reports {
            summary.record(report);
        }
        tracing::info!(
            committed = summary.committed,
            up_to_date = summary.up_to_date,
            skipped = summary.skipped,
            failed = summary.failed,
            timed_out = summary.timed_out,
            "Sync sweep complete"
        );
        summary
    }

    /// Run each dataset on its own interval until shutdown. Returns the
    /// totals across all cycles.
    pub async fn watch(self) -> SweepSummary {
        let handles: Vec<_> = self
            .datasets
            .into_iter()
            .map(|ds| {
                let runner = self.runner.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move { watch_dataset(runner, ds, shutdown).await })
            })
            .collect();

        let mut total = SweepSummary::default();
        for joined in join_all(handles).await {
            match joined {
                Ok(summary) => {
                    total.committed += summary.committed;
                    total.up_to_date += summary.up_to_date;
                    total.skipped += summary.skipped;
                    total.failed += summary.failed;
                    total.timed_out += summary.timed_out;
                    total.cancelled += summary.cancelled;
                }
                Err(e) => tracing::error!("Watch loop panicked: {}", e),
            }
        }
        total
    }
}

async fn watch_dataset(
    runner: BoundedTaskRunner,
    dataset: ScheduledDataset,
    shutdown: CancellationToken,
) -> SweepSummary {
    let mut summary = SweepSummary::default();
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        summary.record(run_bounded(&runner, &dataset).await);

        tracing::info!(
            dataset = %dataset.workflow.dataset_id(),
            interval_secs = dataset.interval.as_secs(),
            "Waiting for next check"
        );
        tokio::select! {
            _ = tokio::time::sleep(dataset.interval) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    tracing::info!(dataset = %dataset.workflow.dataset_id(), "Watch loop stopped");
    summary
}

async fn run_bounded(runner: &BoundedTaskRunner, dataset: &ScheduledDataset) -> RunReport {
    let id = dataset.workflow.dataset_id().to_string();
    let workflow = dataset.workflow.clone();
    let outcome = runner
        .run(&id, dataset.deadline, move |token| async move {
            workflow.run(token).await
        })
        .await;

    match outcome {
        RunnerOutcome::Completed(Ok(RunOutcome::Committed {
            version,
            files,
            bytes,
            notified,
        })) => {
            tracing::info!(
                dataset = %id,
                version = %version,
                files,
                bytes,
                notified,
                "Version committed"
            );
            RunReport::Committed
        }
        RunnerOutcome::Completed(Ok(RunOutcome::NoNewVersion { stored })) => {
            tracing::info!(
                dataset = %id,
                stored = ?stored.map(|v| v.to_iso8601()),
                "No new version"
            );
            RunReport::UpToDate
        }
        RunnerOutcome::Completed(Err(WorkflowError::AlreadyRunning(_))) => {
            tracing::warn!(dataset = %id, "Previous run still active, skipping");
            RunReport::Skipped
        }
        RunnerOutcome::Completed(Err(WorkflowError::Cancelled)) | RunnerOutcome::Cancelled => {
            RunReport::Cancelled
        }
        RunnerOutcome::Completed(Err(e)) => {
            tracing::error!(dataset = %id, "Sync failed: {}", e);
            RunReport::Failed
        }
        RunnerOutcome::DeadlineExceeded => RunReport::TimedOut,
        RunnerOutcome::Aborted(_) => RunReport::Failed,
    }
}
