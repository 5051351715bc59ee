//! Events emitted by a running batch and the observer interface.

use serde::Serialize;

use crate::types::{BatchSummary, JobResult, ProgressUpdate};

/// Everything a batch reports, in emission order.
///
/// For each job `JobFinished` is sent before its `Progress`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started { total: usize },
    JobFinished(JobResult),
    Progress(ProgressUpdate),
    Completed(BatchSummary),
    /// The orchestration loop itself failed. `summary` holds every result
    /// recorded before the failure.
    Failed { summary: BatchSummary, error: String },
}

impl BatchEvent {
    /// Whether no further events follow.
    pub fn is_final(&self) -> bool {
        matches!(self, BatchEvent::Completed(_) | BatchEvent::Failed { .. })
    }
}

/// Callback interface for batch events. Every method defaults to a no-op.
pub trait BatchObserver: Send + Sync {
    fn on_started(&self, _total: usize) {}

    fn on_job_result(&self, _result: &JobResult) {}

    fn on_progress(&self, _progress: &ProgressUpdate) {}

    fn on_batch_complete(&self, _summary: &BatchSummary) {}

    fn on_batch_failed(&self, _summary: &BatchSummary, _error: &str) {}
}

/// Route one event to the matching observer method.
pub fn dispatch(observer: &dyn BatchObserver, event: &BatchEvent) {
    match event {
        BatchEvent::Started { total } => observer.on_started(*total),
        BatchEvent::JobFinished(result) => observer.on_job_result(result),
        BatchEvent::Progress(progress) => observer.on_progress(progress),
        BatchEvent::Completed(summary) => observer.on_batch_complete(summary),
        BatchEvent::Failed { summary, error } => observer.on_batch_failed(summary, error),
    }
}
