//! Batch orchestrator.
//!
//! Drives an ordered job queue on one spawned task: skip check, read,
//! normalize, resolve provider, retry-wrapped describe, record, emit. Exactly
//! one job is in flight at a time. Job failures are recorded and the queue
//! moves on; a panic inside a job is recorded as an `Internal` failure.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use super::control::BatchControl;
use super::events::BatchEvent;
use super::handle::BatchHandle;
use super::state::{BatchState, InFlight};
use crate::config::BatchConfig;
use crate::error::{ErrorKind, ProviderError};
use crate::normalize::ImageNormalizer;
use crate::prompt::PromptLibrary;
use crate::provider::DescribeRequest;
use crate::registry::ProviderRegistry;
use crate::retry::RetryPolicy;
use crate::types::{BatchStatus, BatchSummary, Job, JobError, JobOutcome, JobResult};
use crate::usage::UsageSnapshot;

/// Source of image bytes.
#[async_trait]
pub trait ImageReader: Send + Sync {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;
}

/// Reads from the local filesystem, refusing files above a size limit.
#[derive(Debug, Clone)]
pub struct FsImageReader {
    max_bytes: u64,
}

impl FsImageReader {
    pub fn new(max_file_size_mb: u64) -> Self {
        Self {
            max_bytes: max_file_size_mb.saturating_mul(1024 * 1024),
        }
    }
}

#[async_trait]
impl ImageReader for FsImageReader {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > self.max_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("file is {size} bytes, limit is {} bytes", self.max_bytes),
            ));
        }
        tokio::fs::read(path).await
    }
}

/// Answers whether an image already has a description.
pub trait DescriptionIndex: Send + Sync {
    fn is_described(&self, image: &Path) -> bool;
}

/// Index that knows nothing; every job runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDescriptions;

impl DescriptionIndex for NoDescriptions {
    fn is_described(&self, _image: &Path) -> bool {
        false
    }
}

/// Index over a fixed set of paths.
#[derive(Debug, Clone, Default)]
pub struct PathSetIndex {
    paths: HashSet<PathBuf>,
}

impl PathSetIndex {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl DescriptionIndex for PathSetIndex {
    fn is_described(&self, image: &Path) -> bool {
        self.paths.contains(image)
    }
}

/// Runs batches of jobs against the registry's providers.
#[derive(Clone)]
pub struct BatchOrchestrator {
    registry: Arc<ProviderRegistry>,
    normalizer: ImageNormalizer,
    prompts: Arc<PromptLibrary>,
    retry: RetryPolicy,
    reader: Arc<dyn ImageReader>,
    index: Arc<dyn DescriptionIndex>,
    batch: BatchConfig,
}

impl BatchOrchestrator {
    /// Orchestrator with collaborators built from the registry's config.
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        let config = registry.config();
        Self {
            normalizer: ImageNormalizer::from_config(&config.normalize),
            prompts: Arc::new(PromptLibrary::from_config(&config.prompts)),
            retry: RetryPolicy::from_config(&config.retry),
            reader: Arc::new(FsImageReader::new(config.batch.max_file_size_mb)),
            index: Arc::new(NoDescriptions),
            batch: config.batch.clone(),
            registry,
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn ImageReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_index(mut self, index: Arc<dyn DescriptionIndex>) -> Self {
        self.index = index;
        self
    }

    pub fn with_normalizer(mut self, normalizer: ImageNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Start a batch on a new task. Must be called within a tokio runtime.
    pub fn submit(&self, jobs: Vec<Job>) -> BatchHandle {
        let control = BatchControl::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (usage_tx, usage_rx) = watch::channel(UsageSnapshot::default());
        let total = jobs.len();

        let this = self.clone();
        let task_control = control.clone();
        let task = tokio::spawn(async move {
            this.run_batch(jobs, task_control, event_tx, usage_tx).await
        });

        BatchHandle::new(control, event_rx, usage_rx, task, total)
    }

    async fn run_batch(
        &self,
        jobs: Vec<Job>,
        control: BatchControl,
        events: mpsc::UnboundedSender<BatchEvent>,
        usage: watch::Sender<UsageSnapshot>,
    ) -> BatchSummary {
        let mut state = BatchState::new(jobs);
        tracing::info!(total = state.total(), "Batch started");
        let _ = events.send(BatchEvent::Started {
            total: state.total(),
        });

        let outcome = AssertUnwindSafe(self.drive(&mut state, &control, &events, &usage))
            .catch_unwind()
            .await;

        match outcome {
            Ok(()) => {
                control.complete();
                let summary = state.summary(control.status());
                tracing::info!(
                    status = ?summary.status,
                    completed = summary.completed,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    elapsed_secs = summary.elapsed.as_secs_f64(),
                    "Batch finished"
                );
                let _ = events.send(BatchEvent::Completed(summary.clone()));
                summary
            }
            Err(panic) => {
                let error = panic_message(panic.as_ref());
                control.stop();
                match &state.in_flight {
                    Some(job) => tracing::error!(
                        index = job.index,
                        provider = %job.provider,
                        model = %job.model,
                        "Batch aborted: {error}"
                    ),
                    None => tracing::error!("Batch aborted: {error}"),
                }
                let summary = state.summary(BatchStatus::Stopped);
                let _ = events.send(BatchEvent::Failed {
                    summary: summary.clone(),
                    error,
                });
                summary
            }
        }
    }

    async fn drive(
        &self,
        state: &mut BatchState,
        control: &BatchControl,
        events: &mpsc::UnboundedSender<BatchEvent>,
        usage: &watch::Sender<UsageSnapshot>,
    ) {
        loop {
            // An exhausted queue completes even if a pause arrived meanwhile
            if state.is_exhausted() {
                break;
            }
            match control.status() {
                BatchStatus::Stopped => {
                    tracing::info!("Batch stopped");
                    break;
                }
                BatchStatus::Paused => {
                    tracing::info!("Batch paused");
                    if control.wait_while_paused().await == BatchStatus::Stopped {
                        tracing::info!("Batch stopped while paused");
                        break;
                    }
                    tracing::info!("Batch resumed");
                }
                BatchStatus::Running | BatchStatus::Completed => {}
            }

            let Some((index, job)) = state.next_job() else {
                break;
            };
            state.in_flight = Some(InFlight {
                index,
                provider: job.provider,
                model: job.model.clone(),
            });

            let result = if job.skip_if_described && self.index.is_described(&job.image) {
                tracing::debug!(index, image = %job.image.display(), "Already described, skipping");
                JobResult {
                    index,
                    job,
                    outcome: JobOutcome::Skipped,
                    usage: None,
                    attempts: 0,
                    elapsed: Duration::ZERO,
                }
            } else {
                self.run_job_guarded(index, job).await
            };

            state.in_flight = None;
            let (result, progress) = state.record(result);
            usage.send_replace(state.usage_snapshot());
            let _ = events.send(BatchEvent::JobFinished(result));
            let _ = events.send(BatchEvent::Progress(progress));
        }
    }

    /// Run one job, turning a panic into an `Internal` failure.
    async fn run_job_guarded(&self, index: usize, job: Job) -> JobResult {
        let start = Instant::now();
        match AssertUnwindSafe(self.run_job(index, &job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let error = ProviderError::internal(format!(
                    "job panicked: {}",
                    panic_message(panic.as_ref())
                ));
                self.failed(index, job, error, 0, start)
            }
        }
    }

    async fn run_job(&self, index: usize, job: &Job) -> JobResult {
        let start = Instant::now();
        let label = job.label();
        tracing::debug!(
            index,
            image = %job.image.display(),
            provider = %job.provider,
            model = %job.model,
            "Starting job"
        );

        let bytes = match self.reader.read(&job.image).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let kind = if e.kind() == std::io::ErrorKind::InvalidData {
                    ErrorKind::InvalidRequest
                } else {
                    ErrorKind::Internal
                };
                let error = ProviderError::new(
                    kind,
                    format!("Cannot read {}: {e}", job.image.display()),
                );
                return self.failed(index, job.clone(), error, 0, start);
            }
        };

        let policy = self.registry.normalize_policy(job.provider);
        let hint = job
            .image
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        let normalizer = self.normalizer.clone();
        let normalized = tokio::task::spawn_blocking(move || {
            normalizer.normalize(&bytes, hint.as_deref(), &policy)
        })
        .await;
        let normalized = match normalized {
            Ok(Ok(image)) => image,
            Ok(Err(e)) => {
                return self.failed(index, job.clone(), ProviderError::invalid(e.to_string()), 0, start);
            }
            Err(e) => {
                let error = ProviderError::internal(format!("normalization task failed: {e}"));
                return self.failed(index, job.clone(), error, 0, start);
            }
        };
        tracing::debug!(
            index,
            width = normalized.width,
            height = normalized.height,
            bytes = normalized.bytes.len(),
            quality = normalized.quality,
            "Normalized image"
        );

        let provider = self.registry.resolve(job.provider, &job.model).await;
        let descriptor = provider.descriptor().clone();
        let config = self.registry.config();
        let model = if job.model.is_empty() {
            config.default_model(job.provider).to_string()
        } else {
            job.model.clone()
        };
        let request = DescribeRequest {
            image: normalized.to_payload(),
            prompt: self.prompts.resolve(&job.prompt, &descriptor),
            model,
            max_tokens: config.max_tokens(job.provider),
            temperature: self.batch.temperature,
        };

        let timeout = provider.timeout();
        let request = &request;
        let outcome = self
            .retry
            .run(&label, |attempt| {
                let provider = provider.clone();
                let name = descriptor.name.clone();
                async move {
                    tracing::debug!(index, attempt = attempt + 1, provider = %name, "Calling provider");
                    match tokio::time::timeout(timeout, provider.describe_image(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::timeout(format!(
                            "{name} did not answer within {}s",
                            timeout.as_secs_f64()
                        ))),
                    }
                }
            })
            .await;

        match outcome.result {
            Ok(description) => {
                let text = match &job.description_prefix {
                    Some(prefix) if !prefix.is_empty() => {
                        format!("{prefix}{}{}", self.batch.prefix_separator, description.text)
                    }
                    _ => description.text,
                };
                let usage = description.usage.or_else(|| provider.last_usage());
                tracing::debug!(index, attempts = outcome.attempts, "Job described");
                JobResult {
                    index,
                    job: job.clone(),
                    outcome: JobOutcome::Described {
                        text,
                        model: description.model,
                    },
                    usage,
                    attempts: outcome.attempts,
                    elapsed: start.elapsed(),
                }
            }
            Err(error) => self.failed(index, job.clone(), error, outcome.attempts, start),
        }
    }

    fn failed(
        &self,
        index: usize,
        job: Job,
        error: ProviderError,
        attempts: u32,
        start: Instant,
    ) -> JobResult {
        tracing::error!(
            index,
            image = %job.image.display(),
            provider = %job.provider,
            model = %job.model,
            kind = %error.kind,
            attempts,
            "Job failed: {}",
            error.message
        );
        JobResult {
            index,
            job,
            outcome: JobOutcome::Failed(JobError::from(error)),
            usage: None,
            attempts,
            elapsed: start.elapsed(),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
