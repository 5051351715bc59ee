//! Retry policy for transient provider failures.
//!
//! Failures are classified by [`ErrorKind`]; retryable ones are retried with
//! exponential backoff plus jitter, terminal ones are returned immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ProviderError;

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The last result produced by the operation
    pub result: Result<T, ProviderError>,
    /// Number of attempts made (at least 1)
    pub attempts: u32,
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff before retrying after attempt `attempt` (0-indexed), without jitter.
    ///
    /// `min(base * multiplier^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Add jitter uniformly drawn from `[0.1, 0.5] * delay`.
    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.1..=0.5);
        delay + delay.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails terminally, or retries run out.
    ///
    /// `op` receives the 0-indexed attempt number. `label` only feeds the
    /// retry log lines.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            let result = op(attempt).await;
            let kind = match &result {
                Ok(_) => None,
                Err(e) => Some(e.kind),
            };
            let Some(kind) = kind else {
                return RetryOutcome {
                    result,
                    attempts: attempt + 1,
                };
            };

            if !kind.is_retryable() || attempt >= self.max_retries {
                if kind.is_retryable() {
                    tracing::warn!(
                        target: "glimpse::retry",
                        label,
                        attempts = attempt + 1,
                        kind = %kind,
                        "Retries exhausted"
                    );
                }
                return RetryOutcome {
                    result,
                    attempts: attempt + 1,
                };
            }

            let delay = self.jittered(self.delay_for(attempt));
            tracing::warn!(
                target: "glimpse::retry",
                label,
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                kind = %kind,
                "Retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
