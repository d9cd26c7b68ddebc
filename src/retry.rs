// Shared transient-failure policy. Chunk transfers, the confirm call, QR
// issuance and event-stream connects all go through `RetryPolicy::run`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::ClientError;

/// How an outcome should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Success,
    TransientRetryable,
    Fatal,
}

/// Errors that know whether another attempt could succeed.
pub trait Classify {
    fn disposition(&self) -> Disposition;
}

impl Classify for ClientError {
    fn disposition(&self) -> Disposition {
        match self {
            ClientError::Network(_) => Disposition::TransientRetryable,
            ClientError::Api(e) if e.is_transient() => Disposition::TransientRetryable,
            ClientError::Api(_) => Disposition::Fatal,
        }
    }
}

/// Classify a raw HTTP status. 401 is fatal here; callers that treat it
/// as a re-authentication trigger do so above this layer.
pub fn classify_status(status: u16) -> Disposition {
    match status {
        200..=299 => Disposition::Success,
        500 | 502 | 503 | 504 => Disposition::TransientRetryable,
        _ => Disposition::Fatal,
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out.
    /// The last error is returned unchanged.
    pub async fn run<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.disposition() != Disposition::TransientRetryable {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                warn!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %err,
                    "giving up after transient failures"
                );
                return Err(err);
            }

            let delay = self.delay_for(attempt - 1);
            warn!(
                operation = operation_name,
                attempt,
                max_attempts = self.max_attempts,
                error = %err,
                ?delay,
                "transient failure, retrying"
            );
            sleep(delay).await;
        }
    }
}
