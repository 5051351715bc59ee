//! Stand-in for a provider that could not be constructed.
//!
//! Keeps the construction error so every job routed here fails with the same
//! kind and message instead of aborting the batch.

use async_trait::async_trait;
use std::time::Duration;

use super::{DescribeRequest, Description, VisionProvider};
use crate::error::ProviderError;
use crate::types::{ProviderClass, ProviderDescriptor, UsageRecord};

pub struct UnavailableProvider {
    descriptor: ProviderDescriptor,
    error: ProviderError,
}

impl UnavailableProvider {
    /// Wrap `error`, keeping the limits of the provider it replaces.
    pub fn new(replaces: &ProviderDescriptor, error: ProviderError) -> Self {
        let descriptor = ProviderDescriptor {
            class: ProviderClass::Unavailable,
            supports_live_model_listing: false,
            ..replaces.clone()
        };
        Self { descriptor, error }
    }

    pub fn error(&self) -> &ProviderError {
        &self.error
    }
}

#[async_trait]
impl VisionProvider for UnavailableProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn is_available(&self) -> bool {
        false
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Err(self.error.clone())
    }

    async fn describe_image(&self, _request: &DescribeRequest) -> Result<Description, ProviderError> {
        Err(self.error.clone())
    }

    fn last_usage(&self) -> Option<UsageRecord> {
        None
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }
}
