//! Glimpse Core - provider dispatch and batch orchestration for AI image
//! descriptions.
//!
//! Glimpse sends "describe this image" requests to one of several vision
//! backends (a local Ollama daemon, cloud APIs, an on-device llama.cpp
//! runtime) and runs queues of such requests as controllable batches.
//!
//! # Architecture
//!
//! ```text
//! Job → Read → Normalize (JPEG, per-provider limits) → Registry/Cache
//!     → RetryPolicy → VisionProvider → JobResult → events + usage
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use glimpse_core::{Config, Glimpse, Job, ProviderKind};
//!
//! #[tokio::main]
//! async fn main() -> glimpse_core::Result<()> {
//!     let glimpse = Glimpse::new(Config::load()?);
//!     let handle = glimpse.submit_batch(vec![
//!         Job::new("./beach.jpg", ProviderKind::Ollama, "llava"),
//!     ]);
//!     let summary = handle.wait().await?;
//!     println!("{} described, {} failed", summary.completed, summary.failed);
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod batch;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod discovery;
pub mod error;
pub mod normalize;
pub mod output;
pub mod prompt;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod types;
pub mod usage;

use std::sync::Arc;

// Re-exports for convenient access
pub use batch::{
    BatchEvent, BatchHandle, BatchObserver, BatchOrchestrator, DescriptionIndex, ImageReader,
    NoDescriptions, PathSetIndex,
};
pub use cache::{CacheKey, CacheStats, ProviderInstanceCache};
pub use config::Config;
pub use credentials::{ConfigCredentials, CredentialSource, StaticCredentials};
pub use discovery::{DiscoveredFile, FileDiscovery};
pub use error::{ConfigError, ErrorKind, GlimpseError, NormalizeError, ProviderError, Result};
pub use normalize::{FormatConverter, ImageNormalizer, NormalizePolicy};
pub use output::{OutputFormat, ResultWriter};
pub use prompt::PromptLibrary;
pub use provider::{DescribeRequest, Description, ImagePayload, VisionProvider};
pub use registry::{ProviderFactory, ProviderRegistry};
pub use retry::RetryPolicy;
pub use types::{
    BatchStatus, BatchSummary, Job, JobOutcome, JobResult, ProgressUpdate, Prompt,
    ProviderDescriptor, ProviderKind, UsageRecord,
};
pub use usage::UsageSnapshot;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Glimpse engine - the main entry point for describing images.
///
/// Holds one provider registry (and therefore one instance cache) for the
/// life of the process. Batches submitted through it are independent.
pub struct Glimpse {
    registry: Arc<ProviderRegistry>,
    orchestrator: BatchOrchestrator,
}

impl Glimpse {
    /// Create an engine with config-file credentials and the built-in providers.
    pub fn new(config: Config) -> Self {
        tracing::debug!("Initializing Glimpse v{}", VERSION);
        Self::with_registry(Arc::new(ProviderRegistry::new(Arc::new(config))))
    }

    /// Create an engine with default configuration from disk.
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new(Config::load()?))
    }

    pub fn with_registry(registry: Arc<ProviderRegistry>) -> Self {
        let orchestrator = BatchOrchestrator::new(registry.clone());
        Self {
            registry,
            orchestrator,
        }
    }

    /// Replace the orchestrator collaborators (reader, index, normalizer, retry).
    pub fn configure(mut self, f: impl FnOnce(BatchOrchestrator) -> BatchOrchestrator) -> Self {
        self.orchestrator = f(self.orchestrator);
        self
    }

    /// Get a reference to the current configuration.
    pub fn config(&self) -> &Config {
        self.registry.config()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Start a batch. Must be called within a tokio runtime.
    pub fn submit_batch(&self, jobs: Vec<Job>) -> BatchHandle {
        self.orchestrator.submit(jobs)
    }
}
