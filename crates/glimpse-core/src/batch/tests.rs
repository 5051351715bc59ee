//! Batch scenarios against in-memory images and scripted providers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::config::Config;
use crate::credentials::StaticCredentials;
use crate::error::{ErrorKind, GlimpseError, ProviderError};
use crate::provider::{DescribeRequest, Description, VisionProvider};
use crate::registry::{ProviderFactory, ProviderRegistry};
use crate::types::{
    BatchStatus, BatchSummary, Job, JobOutcome, JobResult, ProgressUpdate, Prompt, ProviderClass,
    ProviderDescriptor, ProviderKind, UsageRecord,
};

type Script = Box<dyn Fn(u32) -> Result<Description, ProviderError> + Send + Sync>;

/// Scripted provider. Each call runs `script` with the per-provider call
/// index, so a test can fail the first k attempts and then succeed.
struct MockProvider {
    descriptor: ProviderDescriptor,
    script: Script,
    calls: Arc<AtomicU32>,
    seen: Arc<Mutex<Vec<(String, String)>>>,
    delay: Option<Duration>,
    timeout: Duration,
    last_usage: Option<UsageRecord>,
}

impl MockProvider {
    fn new(script: Script) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                kind: ProviderKind::Ollama,
                name: "mock".to_string(),
                class: ProviderClass::LocalHttp,
                needs_credential: false,
                supports_custom_prompt: true,
                max_payload_bytes: 1024 * 1024,
                max_dimension: 512,
                supports_live_model_listing: false,
            },
            script,
            calls: Arc::new(AtomicU32::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            timeout: Duration::from_secs(5),
            last_usage: None,
        }
    }

    fn calls(mut self, calls: &Arc<AtomicU32>) -> Self {
        self.calls = calls.clone();
        self
    }

    fn seen(mut self, seen: &Arc<Mutex<Vec<(String, String)>>>) -> Self {
        self.seen = seen.clone();
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn no_custom_prompts(mut self) -> Self {
        self.descriptor.supports_custom_prompt = false;
        self
    }

    fn last_usage(mut self, usage: UsageRecord) -> Self {
        self.last_usage = Some(usage);
        self
    }

    fn arc(self) -> Arc<dyn VisionProvider> {
        Arc::new(self)
    }
}

#[async_trait]
impl VisionProvider for MockProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec![])
    }

    async fn describe_image(&self, request: &DescribeRequest) -> Result<Description, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((request.model.clone(), request.prompt.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(n)
    }

    fn last_usage(&self) -> Option<UsageRecord> {
        self.last_usage.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn describes(text: &'static str, tokens: Option<u32>) -> Script {
    Box::new(move |_| {
        Ok(Description {
            text: text.to_string(),
            model: "mock-v1".to_string(),
            usage: tokens.map(|t| UsageRecord::from_counts(t, 0, Duration::from_millis(1))),
        })
    })
}

fn always(kind: ErrorKind) -> Script {
    Box::new(move |n| Err(ProviderError::new(kind, format!("attempt {n} failed"))))
}

fn panics() -> Script {
    Box::new(|_| panic!("provider bug"))
}

/// Looks providers up by model name; unknown models fail construction.
struct MockFactory {
    providers: HashMap<String, Arc<dyn VisionProvider>>,
}

impl ProviderFactory for MockFactory {
    fn create(
        &self,
        _kind: ProviderKind,
        model: &str,
        _credential: Option<&str>,
    ) -> Result<Arc<dyn VisionProvider>, ProviderError> {
        self.providers
            .get(model)
            .cloned()
            .ok_or_else(|| ProviderError::invalid(format!("unknown model {model}")))
    }
}

struct MemoryReader {
    files: HashMap<PathBuf, Vec<u8>>,
}

#[async_trait]
impl ImageReader for MemoryReader {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
    }
}

fn png() -> Vec<u8> {
    let image = image::DynamicImage::new_rgb8(16, 12);
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, image::ImageFormat::Png).unwrap();
    buffer.into_inner()
}

fn orchestrator(
    providers: Vec<(&str, Arc<dyn VisionProvider>)>,
    files: &[&str],
    max_retries: u32,
) -> BatchOrchestrator {
    let mut config = Config::default();
    config.retry.max_retries = max_retries;
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config.retry.jitter = false;

    let factory = MockFactory {
        providers: providers
            .into_iter()
            .map(|(model, p)| (model.to_string(), p))
            .collect(),
    };
    let registry = ProviderRegistry::with_parts(
        Arc::new(config),
        Arc::new(StaticCredentials::new()),
        Arc::new(factory),
    );
    let reader = MemoryReader {
        files: files.iter().map(|f| (PathBuf::from(f), png())).collect(),
    };
    BatchOrchestrator::new(Arc::new(registry)).with_reader(Arc::new(reader))
}

fn job(image: &str, model: &str) -> Job {
    Job::new(image, ProviderKind::Ollama, model)
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<BatchEvent>) -> Vec<BatchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_jobs_dispatched_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let models = ["m0", "m1", "m2", "m3", "m4"];
    let providers = models
        .iter()
        .map(|m| (*m, MockProvider::new(describes("ok", None)).seen(&seen).arc()))
        .collect();
    let files: Vec<String> = (0..5).map(|i| format!("{i}.png")).collect();
    let file_refs: Vec<&str> = files.iter().map(String::as_str).collect();
    let orch = orchestrator(providers, &file_refs, 0);

    let jobs = models
        .iter()
        .enumerate()
        .map(|(i, m)| job(&files[i], m))
        .collect();
    let handle = orch.submit(jobs);
    let mut rx = handle.events().unwrap();
    let summary = handle.wait().await.unwrap();

    let called: Vec<String> = seen.lock().unwrap().iter().map(|(m, _)| m.clone()).collect();
    assert_eq!(called, models);
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.completed, 5);
    assert_eq!(
        summary.results.iter().map(|r| r.index).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4]
    );

    // Started, then (JobFinished, Progress) per job, then Completed
    let events = drain(&mut rx);
    assert_eq!(events.len(), 1 + 2 * 5 + 1);
    assert!(matches!(events[0], BatchEvent::Started { total: 5 }));
    for i in 0..5 {
        match (&events[1 + 2 * i], &events[2 + 2 * i]) {
            (BatchEvent::JobFinished(result), BatchEvent::Progress(progress)) => {
                assert_eq!(result.index, i);
                assert_eq!(progress.index, i);
                assert_eq!(progress.finished, i + 1);
                assert_eq!(progress.total, 5);
            }
            other => panic!("unexpected events at job {i}: {other:?}"),
        }
    }
    assert!(matches!(events[11], BatchEvent::Completed(_)));
}

#[tokio::test]
async fn test_rate_limited_job_fails_after_retries_and_batch_continues() {
    let busy_calls = Arc::new(AtomicU32::new(0));
    let orch = orchestrator(
        vec![
            ("ok", MockProvider::new(describes("fine", None)).arc()),
            (
                "busy",
                MockProvider::new(always(ErrorKind::RateLimited))
                    .calls(&busy_calls)
                    .arc(),
            ),
        ],
        &["a.png", "b.png", "c.png"],
        2,
    );

    let summary = orch
        .submit(vec![job("a.png", "ok"), job("b.png", "busy"), job("c.png", "ok")])
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(busy_calls.load(Ordering::SeqCst), 3);
    assert_eq!(summary.results[1].attempts, 3);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].index, 1);
    assert_eq!(summary.failures[0].kind, ErrorKind::RateLimited);
    assert_eq!(summary.recoverable_failures().count(), 1);
}

#[tokio::test]
async fn test_auth_failure_is_single_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let orch = orchestrator(
        vec![("m", MockProvider::new(always(ErrorKind::AuthFailed)).calls(&calls).arc())],
        &["a.png"],
        3,
    );
    let summary = orch.submit(vec![job("a.png", "m")]).wait().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.results[0].attempts, 1);
    assert_eq!(summary.configuration_failures().count(), 1);
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let script: Script = Box::new(|n| {
        if n < 2 {
            Err(ProviderError::new(ErrorKind::ServerError, "503"))
        } else {
            Ok(Description {
                text: "third time lucky".to_string(),
                model: "mock-v1".to_string(),
                usage: None,
            })
        }
    });
    let orch = orchestrator(vec![("m", MockProvider::new(script).arc())], &["a.png"], 3);
    let summary = orch.submit(vec![job("a.png", "m")]).wait().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.results[0].attempts, 3);
    assert_eq!(summary.results[0].description(), Some("third time lucky"));
}

#[tokio::test]
async fn test_per_attempt_timeout() {
    let orch = orchestrator(
        vec![(
            "slow",
            MockProvider::new(describes("late", None))
                .delay(Duration::from_millis(300))
                .timeout(Duration::from_millis(20))
                .arc(),
        )],
        &["a.png"],
        1,
    );
    let summary = orch.submit(vec![job("a.png", "slow")]).wait().await.unwrap();
    let result = &summary.results[0];
    assert_eq!(result.error().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(result.attempts, 2);
}

#[tokio::test]
async fn test_pause_holds_queue_until_resume() {
    let calls = Arc::new(AtomicU32::new(0));
    let orch = orchestrator(
        vec![(
            "m",
            MockProvider::new(describes("ok", None))
                .calls(&calls)
                .delay(Duration::from_millis(50))
                .arc(),
        )],
        &["a.png", "b.png", "c.png", "d.png"],
        0,
    );
    let handle = orch.submit(
        ["a.png", "b.png", "c.png", "d.png"]
            .iter()
            .map(|f| job(f, "m"))
            .collect(),
    );

    assert!(handle.pause());
    assert!(!handle.pause(), "pause while paused is a no-op");
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(handle.status(), BatchStatus::Paused);
    assert!(calls.load(Ordering::SeqCst) <= 1);

    assert!(handle.resume());
    assert!(!handle.resume(), "resume while running is a no-op");
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.completed, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_stop_is_terminal_and_wakes_paused_batch() {
    let calls = Arc::new(AtomicU32::new(0));
    let orch = orchestrator(
        vec![(
            "m",
            MockProvider::new(describes("ok", None))
                .calls(&calls)
                .delay(Duration::from_millis(50))
                .arc(),
        )],
        &["a.png", "b.png", "c.png"],
        0,
    );
    let handle = orch.submit(
        ["a.png", "b.png", "c.png"]
            .iter()
            .map(|f| job(f, "m"))
            .collect(),
    );

    handle.pause();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.stop());
    assert!(!handle.resume());
    assert!(!handle.stop());
    assert_eq!(handle.status(), BatchStatus::Stopped);

    let summary = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .expect("stop must wake the paused batch")
        .unwrap();
    assert_eq!(summary.status, BatchStatus::Stopped);
    assert!(summary.processed <= 1);
    assert_eq!(summary.total, 3);
    assert!(calls.load(Ordering::SeqCst) <= 1);
}

#[tokio::test]
async fn test_queue_exhausted_while_paused_completes() {
    let orch = orchestrator(
        vec![(
            "m",
            MockProvider::new(describes("ok", None))
                .delay(Duration::from_millis(100))
                .arc(),
        )],
        &["a.png"],
        0,
    );
    let handle = orch.submit(vec![job("a.png", "m")]);
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.pause();
    let summary = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.completed, 1);
}

#[tokio::test]
async fn test_skip_if_described() {
    let calls = Arc::new(AtomicU32::new(0));
    let orch = orchestrator(
        vec![("m", MockProvider::new(describes("ok", None)).calls(&calls).arc())],
        &["a.png", "b.png", "c.png"],
        0,
    )
    .with_index(Arc::new(PathSetIndex::new([
        PathBuf::from("a.png"),
        PathBuf::from("c.png"),
    ])));

    let summary = orch
        .submit(vec![
            job("a.png", "m").skip_if_described(true),
            job("b.png", "m").skip_if_described(true),
            job("c.png", "m"),
        ])
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.results[0].outcome, JobOutcome::Skipped);
    assert_eq!(summary.results[0].attempts, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_undecodable_image_fails_without_provider_call() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut orch = orchestrator(
        vec![("m", MockProvider::new(describes("ok", None)).calls(&calls).arc())],
        &[],
        3,
    );
    let mut files = HashMap::new();
    files.insert(PathBuf::from("broken.heic"), b"not an image".to_vec());
    orch = orch.with_reader(Arc::new(MemoryReader { files }));

    let summary = orch.submit(vec![job("broken.heic", "m")]).wait().await.unwrap();
    let result = &summary.results[0];
    assert_eq!(result.error().unwrap().kind, ErrorKind::InvalidRequest);
    assert_eq!(result.attempts, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_file_is_internal() {
    let orch = orchestrator(vec![("m", MockProvider::new(describes("ok", None)).arc())], &[], 3);
    let summary = orch.submit(vec![job("gone.png", "m")]).wait().await.unwrap();
    assert_eq!(summary.failures[0].kind, ErrorKind::Internal);
    assert!(summary.failures[0].message.contains("gone.png"));
}

#[tokio::test]
async fn test_unconstructible_provider_fails_job_not_batch() {
    let orch = orchestrator(
        vec![("m", MockProvider::new(describes("ok", None)).arc())],
        &["a.png", "b.png"],
        3,
    );
    let summary = orch
        .submit(vec![job("a.png", "no-such-model"), job("b.png", "m")])
        .wait()
        .await
        .unwrap();
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.failures[0].kind, ErrorKind::InvalidRequest);
    assert_eq!(summary.results[0].attempts, 1);
    assert_eq!(summary.completed, 1);
}

#[tokio::test]
async fn test_prefix_and_prompt_resolution() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let orch = orchestrator(
        vec![
            ("m", MockProvider::new(describes("A cat.", None)).seen(&seen).arc()),
            (
                "captioner",
                MockProvider::new(describes("A dog.", None))
                    .seen(&seen)
                    .no_custom_prompts()
                    .arc(),
            ),
        ],
        &["a.png", "b.png"],
        0,
    );
    let summary = orch
        .submit(vec![
            job("a.png", "m")
                .with_prompt(Prompt::Text("What animal?".into()))
                .with_prefix("Paris, 2024"),
            job("b.png", "captioner").with_prompt(Prompt::Text("What animal?".into())),
        ])
        .wait()
        .await
        .unwrap();

    assert_eq!(summary.results[0].description(), Some("Paris, 2024\n\nA cat."));
    assert_eq!(summary.results[1].description(), Some("A dog."));

    let library = crate::prompt::PromptLibrary::default();
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].1, "What animal?");
    assert_eq!(seen[1].1, library.style_text(crate::prompt::DEFAULT_STYLE));
}

#[tokio::test]
async fn test_usage_snapshot_and_last_usage_fallback() {
    let orch = orchestrator(
        vec![
            ("small", MockProvider::new(describes("ok", Some(100))).arc()),
            ("large", MockProvider::new(describes("ok", Some(300))).arc()),
            (
                "quiet",
                MockProvider::new(describes("ok", None))
                    .last_usage(UsageRecord::from_counts(200, 0, Duration::from_millis(1)))
                    .arc(),
            ),
        ],
        &["a.png", "b.png", "c.png", "d.png"],
        0,
    );
    let handle = orch.submit(vec![
        job("a.png", "small"),
        job("b.png", "large"),
        job("c.png", "large"),
        job("d.png", "quiet"),
    ]);

    let mut status = handle.status_changes();
    status.wait_for(|s| s.is_terminal()).await.unwrap();
    let snapshot = handle.usage_snapshot();
    let summary = handle.wait().await.unwrap();

    assert_eq!(snapshot, summary.usage);
    assert_eq!(snapshot.count, 4);
    assert_eq!(snapshot.total, 900);
    assert_eq!(snapshot.avg_total, 225.0);
    let peak = snapshot.peak.unwrap();
    assert_eq!(peak.total_tokens, 300);
    assert_eq!(peak.label, "b.png");
}

#[tokio::test]
async fn test_panic_in_job_is_recorded_as_internal() {
    let orch = orchestrator(
        vec![
            ("buggy", MockProvider::new(panics()).arc()),
            ("m", MockProvider::new(describes("ok", None)).arc()),
        ],
        &["a.png", "b.png"],
        3,
    );
    let summary = orch
        .submit(vec![job("a.png", "buggy"), job("b.png", "m")])
        .wait()
        .await
        .unwrap();
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.failures[0].kind, ErrorKind::Internal);
    assert!(summary.failures[0].message.contains("provider bug"));
    assert_eq!(summary.completed, 1);
}

struct PanickingIndex;

impl DescriptionIndex for PanickingIndex {
    fn is_described(&self, _image: &Path) -> bool {
        panic!("index corrupted")
    }
}

#[tokio::test]
async fn test_loop_failure_emits_failed_with_partial_summary() {
    let orch = orchestrator(
        vec![("m", MockProvider::new(describes("ok", None)).arc())],
        &["a.png", "b.png", "c.png"],
        0,
    )
    .with_index(Arc::new(PanickingIndex));

    let handle = orch.submit(vec![
        job("a.png", "m"),
        job("b.png", "m").skip_if_described(true),
        job("c.png", "m"),
    ]);
    let mut rx = handle.events().unwrap();
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.status, BatchStatus::Stopped);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.processed, 2);

    let events = drain(&mut rx);
    match events.last() {
        Some(BatchEvent::Failed { summary, error }) => {
            assert!(error.contains("index corrupted"));
            assert_eq!(summary.completed, 1);
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[derive(Default)]
struct CountingObserver {
    started: AtomicUsize,
    results: AtomicUsize,
    progress: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl BatchObserver for CountingObserver {
    fn on_started(&self, _total: usize) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_job_result(&self, _result: &JobResult) {
        self.results.fetch_add(1, Ordering::SeqCst);
    }

    fn on_progress(&self, _progress: &ProgressUpdate) {
        self.progress.fetch_add(1, Ordering::SeqCst);
    }

    fn on_batch_complete(&self, _summary: &BatchSummary) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_batch_failed(&self, _summary: &BatchSummary, _error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_observer_sees_buffered_events_once() {
    let orch = orchestrator(
        vec![("m", MockProvider::new(describes("ok", None)).arc())],
        &["a.png", "b.png", "c.png"],
        0,
    );
    let handle = orch.submit(
        ["a.png", "b.png", "c.png"]
            .iter()
            .map(|f| job(f, "m"))
            .collect(),
    );
    // Attach late; events are buffered
    tokio::time::sleep(Duration::from_millis(50)).await;

    let observer = Arc::new(CountingObserver::default());
    let forwarder = handle.subscribe(observer.clone()).unwrap();
    assert!(matches!(
        handle.subscribe(observer.clone()),
        Err(GlimpseError::AlreadySubscribed)
    ));
    assert!(handle.events().is_err());

    handle.wait().await.unwrap();
    forwarder.await.unwrap();

    assert_eq!(observer.started.load(Ordering::SeqCst), 1);
    assert_eq!(observer.results.load(Ordering::SeqCst), 3);
    assert_eq!(observer.progress.load(Ordering::SeqCst), 3);
    assert_eq!(observer.completed.load(Ordering::SeqCst), 1);
    assert_eq!(observer.failed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_batch_completes() {
    let orch = orchestrator(vec![], &[], 0);
    let summary = orch.submit(Vec::new()).wait().await.unwrap();
    assert_eq!(summary.status, BatchStatus::Completed);
    assert_eq!(summary.total, 0);
    assert_eq!(summary.usage, crate::usage::UsageSnapshot::default());
}
