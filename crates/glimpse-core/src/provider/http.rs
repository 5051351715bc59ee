//! Shared HTTP plumbing for the daemon and cloud providers.

use std::time::Duration;

use crate::error::{ErrorKind, ProviderError};

/// Longest body excerpt kept in error messages.
const BODY_EXCERPT: usize = 300;

/// Timeout for availability probes and model listing.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which status table applies to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusTable {
    Local,
    Cloud,
}

impl StatusTable {
    pub(crate) fn classify(self, status: u16) -> ErrorKind {
        match self {
            StatusTable::Local => ErrorKind::from_local_status(status),
            StatusTable::Cloud => ErrorKind::from_cloud_status(status),
        }
    }
}

pub(crate) fn build_client(provider: &str) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .user_agent(concat!("glimpse/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::internal(format!("{provider}: cannot build HTTP client: {e}")))
}

/// Turn a non-success response into a classified error, keeping a short
/// excerpt of the body.
pub(crate) async fn error_from_response(
    provider: &str,
    table: StatusTable,
    resp: reqwest::Response,
) -> ProviderError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let excerpt: String = body.trim().chars().take(BODY_EXCERPT).collect();
    ProviderError::new(
        table.classify(status.as_u16()),
        format!("{provider} HTTP {status}: {excerpt}"),
    )
    .with_status(status.as_u16())
}

/// Send a request, mapping transport failures and error statuses.
pub(crate) async fn send(
    provider: &str,
    table: StatusTable,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ProviderError> {
    let resp = request
        .send()
        .await
        .map_err(|e| ProviderError::from_transport(provider, &e))?;
    if !resp.status().is_success() {
        return Err(error_from_response(provider, table, resp).await);
    }
    Ok(resp)
}

/// Parse a JSON body; a body we can't parse is the backend's fault.
pub(crate) async fn parse_json<T: serde::de::DeserializeOwned>(
    provider: &str,
    resp: reqwest::Response,
) -> Result<T, ProviderError> {
    resp.json().await.map_err(|e| {
        ProviderError::new(
            ErrorKind::ServerError,
            format!("Failed to parse {provider} response: {e}"),
        )
    })
}
