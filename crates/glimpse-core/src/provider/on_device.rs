//! On-device provider backed by a llama.cpp server.
//!
//! The provider owns one `llama-server` child process holding the GGUF model
//! and its vision projector in memory. It is started on first use, reused for
//! every later call, restarted if it exits, and killed when the provider is
//! dropped. Requests go over the server's OpenAI-compatible endpoint on the
//! loopback interface.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::http::{self, StatusTable, PROBE_TIMEOUT};
use super::openai::{into_description, user_message, ChatMessage, ChatResponse};
use super::{DescribeRequest, Description, UsageSlot, VisionProvider};
use crate::config::{expand_path, OnDeviceConfig};
use crate::error::{ErrorKind, ProviderError};
use crate::types::{ProviderDescriptor, ProviderKind, UsageRecord};

const NAME: &str = "on_device";
const PROJECTOR_PREFIX: &str = "mmproj";
const HEALTH_POLL: Duration = Duration::from_millis(250);
/// Server log lines kept for error messages.
const LOG_TAIL_LINES: usize = 40;
/// Longest log excerpt kept in error messages.
const LOG_EXCERPT: usize = 300;

/// Local multimodal runtime.
pub struct OnDeviceProvider {
    command: String,
    model_dir: PathBuf,
    model: String,
    mmproj: PathBuf,
    port: Option<u16>,
    gpu_layers: Option<u32>,
    threads: Option<u32>,
    descriptor: ProviderDescriptor,
    timeout: Duration,
    startup_timeout: Duration,
    client: reqwest::Client,
    server: tokio::sync::Mutex<Option<ServerProcess>>,
    ready: AtomicBool,
    usage: UsageSlot,
}

/// A running server and the tail of its log.
struct ServerProcess {
    child: Child,
    base_url: String,
    _log: LogTail,
}

/// Last lines the server wrote to stderr.
#[derive(Clone, Default)]
struct LogTail(Arc<Mutex<VecDeque<String>>>);

impl LogTail {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.0.lock() {
            if lines.len() == LOG_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    /// The end of the log, where llama.cpp reports what went wrong.
    fn excerpt(&self) -> String {
        let joined = self
            .0
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();
        let trimmed = joined.trim();
        let skip = trimmed.chars().count().saturating_sub(LOG_EXCERPT);
        trimmed.chars().skip(skip).collect()
    }

    async fn collect(self, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::trace!(target: "glimpse::on_device", "{line}");
            self.push(line);
        }
    }
}

#[derive(Serialize)]
struct ServerRequest<'a> {
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

impl OnDeviceProvider {
    /// Build a runtime for `model`, checking that the model and projector
    /// files exist. The server itself starts on the first call.
    pub fn new(config: &OnDeviceConfig, model: &str) -> Result<Self, ProviderError> {
        let model_dir = expand_path(&config.model_dir);
        let model_path = model_file(&model_dir, model);
        if !model_path.is_file() {
            return Err(ProviderError::invalid(format!(
                "On-device model not found: {}",
                model_path.display()
            )));
        }
        let mmproj = config
            .mmproj
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| model_dir.join(format!("{PROJECTOR_PREFIX}-{model}.gguf")));
        if !mmproj.is_file() {
            return Err(ProviderError::invalid(format!(
                "Vision projector not found: {}",
                mmproj.display()
            )));
        }

        Ok(Self {
            command: config.command.clone(),
            model_dir,
            model: model.to_string(),
            mmproj,
            port: config.port,
            gpu_layers: config.gpu_layers,
            threads: config.threads,
            descriptor: Self::descriptor_for(config),
            timeout: Duration::from_millis(config.timeout_ms),
            startup_timeout: Duration::from_millis(config.startup_timeout_ms),
            client: http::build_client(NAME)?,
            server: tokio::sync::Mutex::new(None),
            ready: AtomicBool::new(false),
            usage: UsageSlot::default(),
        })
    }

    pub fn descriptor_for(config: &OnDeviceConfig) -> ProviderDescriptor {
        ProviderDescriptor {
            kind: ProviderKind::OnDevice,
            name: NAME.to_string(),
            class: ProviderKind::OnDevice.class(),
            needs_credential: false,
            supports_custom_prompt: config.custom_prompts,
            max_payload_bytes: config.max_payload_bytes,
            max_dimension: config.max_dimension,
            supports_live_model_listing: false,
        }
    }

    fn server_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            model_file(&self.model_dir, &self.model).to_string_lossy().into_owned(),
            "--mmproj".to_string(),
            self.mmproj.to_string_lossy().into_owned(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(layers) = self.gpu_layers {
            args.extend(["-ngl".to_string(), layers.to_string()]);
        }
        if let Some(threads) = self.threads {
            args.extend(["-t".to_string(), threads.to_string()]);
        }
        args
    }

    /// Base URL of a live server, starting or restarting it as needed.
    async fn ensure_server(&self) -> Result<String, ProviderError> {
        let mut slot = self.server.lock().await;
        if let Some(server) = slot.as_mut() {
            match server.child.try_wait() {
                Ok(None) => return Ok(server.base_url.clone()),
                Ok(Some(status)) => {
                    tracing::warn!(model = %self.model, "On-device server exited ({status}), restarting");
                }
                Err(e) => {
                    tracing::warn!(model = %self.model, "On-device server state unknown ({e}), restarting");
                }
            }
            *slot = None;
            self.ready.store(false, Ordering::Release);
        }

        let server = self.start_server().await?;
        let base_url = server.base_url.clone();
        *slot = Some(server);
        self.ready.store(true, Ordering::Release);
        Ok(base_url)
    }

    async fn start_server(&self) -> Result<ServerProcess, ProviderError> {
        let port = match self.port {
            Some(port) => port,
            None => free_port()?,
        };
        tracing::info!(model = %self.model, port, "Starting on-device server");

        let mut child = Command::new(&self.command)
            .args(self.server_args(port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::internal(format!("Cannot run {}: {e}", self.command)))?;

        let log = LogTail::default();
        let collector = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(log.clone().collect(stderr)));

        let base_url = format!("http://127.0.0.1:{port}");
        let start = Instant::now();
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                if let Some(collector) = collector {
                    // Let the reader drain what the process wrote before exiting
                    let _ = tokio::time::timeout(Duration::from_millis(500), collector).await;
                }
                let excerpt = log.excerpt();
                return Err(ProviderError::new(
                    classify_exit(&excerpt),
                    format!("{} exited with {status} while loading {}: {excerpt}", self.command, self.model),
                ));
            }
            if self.is_healthy(&base_url).await {
                break;
            }
            if start.elapsed() >= self.startup_timeout {
                // Dropping `child` kills the process
                return Err(ProviderError::timeout(format!(
                    "{} did not become ready within {}s: {}",
                    self.command,
                    self.startup_timeout.as_secs_f64(),
                    log.excerpt()
                )));
            }
            tokio::time::sleep(HEALTH_POLL).await;
        }

        tracing::info!(
            model = %self.model,
            load_secs = start.elapsed().as_secs_f64(),
            "On-device server ready"
        );
        Ok(ServerProcess {
            child,
            base_url,
            _log: log,
        })
    }

    /// `/health` answers 503 while the model loads and 200 once it serves.
    async fn is_healthy(&self, base_url: &str) -> bool {
        self.client
            .get(format!("{base_url}/health"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }
}

fn model_file(dir: &Path, model: &str) -> PathBuf {
    if model.ends_with(".gguf") {
        dir.join(model)
    } else {
        dir.join(format!("{model}.gguf"))
    }
}

/// Ask the OS for an unused loopback port.
fn free_port() -> Result<u16, ProviderError> {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(|e| ProviderError::internal(format!("Cannot pick a port for the server: {e}")))
}

/// Model stems available in `dir`, projector files excluded.
pub fn list_model_files(dir: &Path) -> Result<Vec<String>, ProviderError> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ProviderError::invalid(format!("Cannot read model directory {}: {e}", dir.display()))
    })?;
    let mut models: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("gguf"))
        .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(String::from))
        .filter(|stem| !stem.starts_with(PROJECTOR_PREFIX))
        .collect();
    models.sort();
    Ok(models)
}

/// Locate an executable by absolute path or on `PATH`.
fn find_executable(command: &str) -> Option<PathBuf> {
    let candidate = expand_path(Path::new(command));
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|p| p.is_file())
}

fn classify_exit(log: &str) -> ErrorKind {
    let lower = log.to_lowercase();
    if lower.contains("failed to load") || lower.contains("invalid argument") {
        ErrorKind::InvalidRequest
    } else if lower.contains("out of memory") {
        ErrorKind::ServerError
    } else {
        ErrorKind::Internal
    }
}

#[async_trait]
impl VisionProvider for OnDeviceProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn is_available(&self) -> bool {
        find_executable(&self.command).is_some()
            && model_file(&self.model_dir, &self.model).is_file()
            && self.mmproj.is_file()
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        list_model_files(&self.model_dir)
    }

    async fn describe_image(&self, request: &DescribeRequest) -> Result<Description, ProviderError> {
        let start = Instant::now();
        let base_url = self.ensure_server().await?;

        let body = ServerRequest {
            messages: vec![user_message(request)],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let resp = http::send(
            NAME,
            StatusTable::Local,
            self.client
                .post(format!("{base_url}/v1/chat/completions"))
                .json(&body)
                .timeout(self.timeout),
        )
        .await?;
        let body: ChatResponse = http::parse_json(NAME, resp).await?;

        let description = into_description(NAME, body, &self.model, start.elapsed())?;
        if let Some(usage) = &description.usage {
            self.usage.set(usage.clone());
        }
        Ok(description)
    }

    fn last_usage(&self) -> Option<UsageRecord> {
        self.usage.get()
    }

    /// Until the server is up, the first call also has to wait out the model load.
    fn timeout(&self) -> Duration {
        if self.ready.load(Ordering::Acquire) {
            self.timeout
        } else {
            self.timeout + self.startup_timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ImagePayload;

    fn model_dir_with(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in files {
            std::fs::write(dir.path().join(name), b"gguf").unwrap();
        }
        dir
    }

    fn config_for(dir: &Path) -> OnDeviceConfig {
        OnDeviceConfig {
            model_dir: dir.to_path_buf(),
            ..OnDeviceConfig::default()
        }
    }

    fn request() -> DescribeRequest {
        DescribeRequest {
            image: ImagePayload::from_bytes(&[0xFF, 0xD8], "jpeg"),
            prompt: "Describe.".to_string(),
            model: "tiny".to_string(),
            max_tokens: 16,
            temperature: 0.3,
        }
    }

    #[test]
    fn test_construction_requires_model_and_projector() {
        let dir = model_dir_with(&["tiny.gguf"]);
        let err = OnDeviceProvider::new(&config_for(dir.path()), "tiny").err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(err.message.contains("projector"));

        let err = OnDeviceProvider::new(&config_for(dir.path()), "missing").err().unwrap();
        assert!(err.message.contains("model not found"));

        std::fs::write(dir.path().join("mmproj-tiny.gguf"), b"gguf").unwrap();
        assert!(OnDeviceProvider::new(&config_for(dir.path()), "tiny").is_ok());
    }

    #[test]
    fn test_list_model_files_skips_projectors() {
        let dir = model_dir_with(&["b.gguf", "a.gguf", "mmproj-a.gguf", "notes.txt"]);
        assert_eq!(list_model_files(dir.path()).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_server_args_include_projector_and_limits() {
        let dir = model_dir_with(&["tiny.gguf", "mmproj-tiny.gguf"]);
        let mut config = config_for(dir.path());
        config.threads = Some(4);
        let provider = OnDeviceProvider::new(&config, "tiny").unwrap();
        let joined = provider.server_args(8089).join(" ");
        assert!(joined.contains("tiny.gguf --mmproj"));
        assert!(joined.contains("mmproj-tiny.gguf"));
        assert!(joined.contains("--host 127.0.0.1 --port 8089"));
        assert!(joined.contains("-ngl 99"));
        assert!(joined.contains("-t 4"));
    }

    #[test]
    fn test_request_body_carries_image_and_budget() {
        let request = request();
        let body = ServerRequest {
            messages: vec![user_message(&request)],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["max_tokens"], 16);
        assert_eq!(value["messages"][0]["content"][0]["type"], "image_url");
        assert_eq!(value["messages"][0]["content"][1]["text"], "Describe.");
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit("error: failed to load model"), ErrorKind::InvalidRequest);
        assert_eq!(classify_exit("CUDA error: out of memory"), ErrorKind::ServerError);
        assert_eq!(classify_exit("segfault"), ErrorKind::Internal);
    }

    #[test]
    fn test_log_tail_keeps_the_end() {
        let log = LogTail::default();
        for i in 0..100 {
            log.push(format!("line {i}"));
        }
        let excerpt = log.excerpt();
        assert!(excerpt.ends_with("line 99"));
        assert!(!excerpt.contains("line 10\n"));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_internal_and_unavailable() {
        let dir = model_dir_with(&["tiny.gguf", "mmproj-tiny.gguf"]);
        let mut config = config_for(dir.path());
        config.command = "glimpse-no-such-runtime-xyz".to_string();
        let provider = OnDeviceProvider::new(&config, "tiny").unwrap();
        assert!(!provider.is_available().await);

        let err = provider.describe_image(&request()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_first_call_timeout_covers_model_load() {
        let dir = model_dir_with(&["tiny.gguf", "mmproj-tiny.gguf"]);
        let config = config_for(dir.path());
        let provider = OnDeviceProvider::new(&config, "tiny").unwrap();
        assert_eq!(
            provider.timeout(),
            Duration::from_millis(config.timeout_ms + config.startup_timeout_ms)
        );
        provider.ready.store(true, Ordering::Release);
        assert_eq!(provider.timeout(), Duration::from_millis(config.timeout_ms));
    }

    #[cfg(unix)]
    mod fake_server {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::atomic::AtomicUsize;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        /// Shell script standing in for `llama-server`. Each start appends a
        /// line to `starts`.
        fn runtime_script(dir: &Path, body: &str) -> String {
            let path = dir.join("fake-llama-server");
            let starts = dir.join("starts");
            std::fs::write(
                &path,
                format!("#!/bin/sh\necho started >> '{}'\n{body}\n", starts.display()),
            )
            .unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn starts(dir: &Path) -> usize {
            std::fs::read_to_string(dir.join("starts"))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        /// Minimal HTTP endpoint answering `/health` and chat completions.
        async fn serve(listener: TcpListener, completions: Arc<AtomicUsize>) {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let completions = completions.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let head_end = loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
                    let length: usize = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(0);
                    while buf.len() < head_end + length {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }

                    let body = if head.starts_with("get /health") {
                        r#"{"status":"ok"}"#.to_string()
                    } else {
                        let n = completions.fetch_add(1, Ordering::SeqCst) + 1;
                        format!(
                            r#"{{"choices":[{{"message":{{"content":"Description {n}."}},"finish_reason":"stop"}}],
                               "usage":{{"prompt_tokens":600,"completion_tokens":20,"total_tokens":620}}}}"#
                        )
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        }

        #[tokio::test]
        async fn test_server_started_once_and_reused() {
            let dir = model_dir_with(&["tiny.gguf", "mmproj-tiny.gguf"]);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let completions = Arc::new(AtomicUsize::new(0));
            tokio::spawn(serve(listener, completions.clone()));

            let mut config = config_for(dir.path());
            config.command = runtime_script(dir.path(), "exec sleep 30");
            config.port = Some(port);
            let provider = OnDeviceProvider::new(&config, "tiny").unwrap();

            let first = provider.describe_image(&request()).await.unwrap();
            let second = provider.describe_image(&request()).await.unwrap();
            assert_eq!(first.text, "Description 1.");
            assert_eq!(second.text, "Description 2.");
            assert_eq!(second.model, "tiny");
            assert_eq!(provider.last_usage().unwrap().total_tokens, 620);

            assert_eq!(starts(dir.path()), 1, "model must be loaded once");
            assert_eq!(completions.load(Ordering::SeqCst), 2);
            assert_eq!(provider.timeout(), Duration::from_millis(config.timeout_ms));
        }

        #[tokio::test]
        async fn test_load_failure_is_classified_from_log() {
            let dir = model_dir_with(&["tiny.gguf", "mmproj-tiny.gguf"]);
            let mut config = config_for(dir.path());
            config.command = runtime_script(
                dir.path(),
                "echo 'llama_model_load: error: failed to load model' >&2\nexit 1",
            );
            let provider = OnDeviceProvider::new(&config, "tiny").unwrap();

            let err = provider.describe_image(&request()).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidRequest);
            assert!(err.message.contains("failed to load model"));

            // A later call tries to start the server again
            let _ = provider.describe_image(&request()).await;
            assert_eq!(starts(dir.path()), 2);
        }

        #[tokio::test]
        async fn test_startup_timeout_kills_server() {
            let dir = model_dir_with(&["tiny.gguf", "mmproj-tiny.gguf"]);
            let mut config = config_for(dir.path());
            config.command = runtime_script(dir.path(), "exec sleep 30");
            config.startup_timeout_ms = 300;
            let provider = OnDeviceProvider::new(&config, "tiny").unwrap();

            let err = provider.describe_image(&request()).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Timeout);
            assert!(provider.server.lock().await.is_none());
        }
    }
}
