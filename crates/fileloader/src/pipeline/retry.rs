//! Transient-failure retry with exponential backoff
//!
//! Only errors classified transient are retried; everything else surfaces
//! immediately. Cancellation is honoured before every attempt and during
//! every backoff sleep.

use fileloader_common::{LoadError, LoadResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub attempts: u32,
    pub base_delay: Duration,
    /// Per-attempt deadline; exceeding it counts as a transient failure.
    pub op_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            op_timeout: None,
        }
    }

    pub fn with_op_timeout(mut self, timeout_secs: u64) -> Self {
        self.op_timeout = Some(Duration::from_secs(timeout_secs));
        self
    }

    /// 1s, 2s, 4s, ... for the default base delay.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry.saturating_sub(1))
    }

    /// No retries; used where a second attempt is not known to be safe.
    pub fn none() -> Self {
        Self {
            attempts: 0,
            base_delay: Duration::ZERO,
            op_timeout: None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_RETRY_ATTEMPTS,
            crate::config::DEFAULT_RETRY_BASE_DELAY_MS,
        )
    }
}

/// Run `operation`, retrying transient failures per the policy.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op_name: &str,
    mut operation: F,
) -> LoadResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LoadResult<T>>,
{
    let mut retries = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        let attempt_result = match policy.op_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(LoadError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("{op_name} exceeded its {}s deadline", limit.as_secs()),
                ))),
            },
            None => operation().await,
        };
        match attempt_result {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && retries < policy.attempts => {
                retries += 1;
                let delay = policy.delay_for(retries);
                warn!(
                    op = op_name,
                    retry = retries,
                    max_retries = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                }
            },
            Err(error) => return Err(error),
        }
    }
}
