//! Bookkeeping for one batch run.

use std::time::{Duration, Instant};

use crate::types::{
    BatchStatus, BatchSummary, FailureSummary, Job, JobOutcome, JobResult, ProgressUpdate,
    ProviderKind,
};
use crate::usage::{UsageAccumulator, UsageSnapshot};

/// The job currently being worked on, for failure reports.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub index: usize,
    pub provider: ProviderKind,
    pub model: String,
}

/// Owned by the batch task. The cursor only moves forward.
pub(crate) struct BatchState {
    jobs: Vec<Job>,
    cursor: usize,
    completed: usize,
    failed: usize,
    skipped: usize,
    results: Vec<JobResult>,
    failures: Vec<FailureSummary>,
    usage: UsageAccumulator,
    /// Wall time over jobs that reached a provider or failed trying
    dispatched_elapsed: Duration,
    dispatched: usize,
    pub in_flight: Option<InFlight>,
    started: Instant,
}

impl BatchState {
    pub(crate) fn new(jobs: Vec<Job>) -> Self {
        Self {
            results: Vec::with_capacity(jobs.len()),
            jobs,
            cursor: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            failures: Vec::new(),
            usage: UsageAccumulator::new(),
            dispatched_elapsed: Duration::ZERO,
            dispatched: 0,
            in_flight: None,
            started: Instant::now(),
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.jobs.len()
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.cursor >= self.jobs.len()
    }

    /// Take the next job off the queue.
    pub(crate) fn next_job(&mut self) -> Option<(usize, Job)> {
        let job = self.jobs.get(self.cursor)?.clone();
        let index = self.cursor;
        self.cursor += 1;
        Some((index, job))
    }

    /// Record a finished job and compute the progress that follows it.
    pub(crate) fn record(&mut self, result: JobResult) -> (JobResult, ProgressUpdate) {
        match &result.outcome {
            JobOutcome::Described { .. } => self.completed += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Failed(error) => {
                self.failed += 1;
                self.failures.push(FailureSummary {
                    index: result.index,
                    image: result.job.image.clone(),
                    kind: error.kind,
                    message: error.message.clone(),
                });
            }
        }
        if !matches!(result.outcome, JobOutcome::Skipped) {
            self.dispatched += 1;
            self.dispatched_elapsed += result.elapsed;
        }
        if let Some(usage) = &result.usage {
            self.usage.record(&result.job.label(), usage);
        }

        let finished = self.results.len() + 1;
        let average = if self.dispatched == 0 {
            Duration::ZERO
        } else {
            self.dispatched_elapsed / self.dispatched as u32
        };
        let remaining = self.total().saturating_sub(finished);
        let progress = ProgressUpdate {
            index: result.index,
            finished,
            total: self.total(),
            average,
            eta: average * remaining as u32,
        };
        self.results.push(result.clone());
        (result, progress)
    }

    pub(crate) fn usage_snapshot(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    pub(crate) fn summary(&self, status: BatchStatus) -> BatchSummary {
        BatchSummary {
            status,
            total: self.total(),
            processed: self.cursor,
            completed: self.completed,
            failed: self.failed,
            skipped: self.skipped,
            failures: self.failures.clone(),
            results: self.results.clone(),
            usage: self.usage.snapshot(),
            elapsed: self.started.elapsed(),
        }
    }
}
