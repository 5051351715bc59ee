//! Error types for Glimpse.
//!
//! Provider failures are plain values carrying an [`ErrorKind`], so the retry
//! policy and the batch orchestrator branch on the kind rather than on message
//! text. Everything else (configuration, I/O, normalization) has its own enum.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for Glimpse operations.
#[derive(Error, Debug)]
pub enum GlimpseError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A provider call or provider construction failed
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Image normalization failed
    #[error("Normalization error: {0}")]
    Normalize(#[from] NormalizeError),

    /// The batch event stream was already taken by another subscriber
    #[error("Batch events already subscribed")]
    AlreadySubscribed,

    /// The batch task ended without producing a summary
    #[error("Batch task aborted: {0}")]
    BatchAborted(String),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Classified failure of a provider operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call exceeded its deadline
    Timeout,
    /// The backend asked us to slow down (HTTP 429 or equivalent)
    RateLimited,
    /// The backend failed on its side (HTTP 5xx)
    ServerError,
    /// The backend could not be reached (refused, reset, DNS)
    Connection,
    /// Missing or rejected credential
    AuthFailed,
    /// The backend rejected the request as malformed or unsupported
    InvalidRequest,
    /// The backend answered without any text. Usually means the token budget
    /// was spent before output started.
    EmptyResponse,
    /// Environment or programmer fault outside the provider call
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind is worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
                | ErrorKind::Connection
        )
    }

    /// Map a non-success HTTP status from a local daemon.
    ///
    /// Local daemons have no auth layer, so anything that is not throttling or
    /// a server fault is treated as a bad request.
    pub fn from_local_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::InvalidRequest,
        }
    }

    /// Map a non-success HTTP status from a cloud API.
    pub fn from_cloud_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::AuthFailed,
            408 => ErrorKind::Timeout,
            other => Self::from_local_status(other),
        }
    }

    /// Stable identifier used in logs and output records.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Connection => "connection",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::EmptyResponse => "empty_response",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider failure returned as a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    /// Classified failure kind
    pub kind: ErrorKind,
    /// Human-readable detail (provider name, HTTP body excerpt, ...)
    pub message: String,
    /// HTTP status, when the failure came from an HTTP response
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EmptyResponse, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Classify a transport-level `reqwest` failure.
    ///
    /// Status-bearing errors go through the cloud status table; connection and
    /// timeout failures keep their own retryable kinds; body decode failures
    /// are terminal.
    pub fn from_transport(provider: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Connection
        } else if let Some(status) = err.status() {
            ErrorKind::from_cloud_status(status.as_u16())
        } else if err.is_decode() || err.is_builder() {
            ErrorKind::InvalidRequest
        } else if err.is_request() || err.is_body() {
            ErrorKind::Connection
        } else {
            ErrorKind::ServerError
        };
        Self {
            kind,
            message: format!("{provider} request failed: {err}"),
            status_code: err.status().map(|s| s.as_u16()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Image normalization errors.
#[derive(Error, Debug)]
pub enum NormalizeError {
    /// The bytes could not be decoded, even after format conversion
    #[error("Cannot decode image{}: {message}", hint_suffix(.hint))]
    Decode {
        hint: Option<String>,
        message: String,
    },

    /// Even the lowest quality setting exceeds the payload ceiling
    #[error("Encoded image is {size} bytes at quality {quality}, ceiling is {max_bytes} bytes")]
    TooLarge {
        size: usize,
        max_bytes: usize,
        quality: u8,
    },

    /// JPEG encoding failed
    #[error("JPEG encode failed: {0}")]
    Encode(String),

    /// The external format converter failed
    #[error("Format conversion failed for {path}: {message}")]
    Conversion { path: PathBuf, message: String },
}

fn hint_suffix(hint: &Option<String>) -> String {
    hint.as_ref()
        .map(|h| format!(" ({h})"))
        .unwrap_or_default()
}

/// Convenience type alias for Glimpse results.
pub type Result<T> = std::result::Result<T, GlimpseError>;
