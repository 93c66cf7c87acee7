//! Bounded retry of remote calls with a per-attempt timeout.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use jobtrack_common::{Error, Result};

/// How the delay between attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// The same delay before every retry.
    Fixed,
    /// Delay multiplied on each retry, capped, optionally jittered.
    Exponential {
        multiplier: f64,
        max_delay_ms: u64,
        jitter: bool,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub delay: Duration,
    /// Ceiling for a single attempt; on expiry the attempt is cancelled.
    pub attempt_timeout: Duration,
    /// Delay growth.
    pub backoff: BackoffPolicy,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::Fixed,
        }
    }

    /// Set delay between attempts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set per-attempt timeout.
    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Set backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Calculate the delay after a failed attempt (0-based retry number).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self.backoff {
            BackoffPolicy::Fixed => self.delay,
            BackoffPolicy::Exponential {
                multiplier,
                max_delay_ms,
                jitter,
            } => {
                let base_delay = self.delay.as_millis() as f64 * multiplier.powi(retry as i32);
                let capped_delay = base_delay.min(max_delay_ms as f64);

                let final_delay = if jitter {
                    // Add random jitter of +/- 25%
                    let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
                    capped_delay * jitter_factor
                } else {
                    capped_delay
                };

                Duration::from_millis(final_delay as u64)
            }
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Result of a retried operation together with the attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Retry executor for running operations with retry logic.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation with retry logic.
    ///
    /// Each attempt is bounded by the attempt timeout; an attempt that
    /// times out is dropped (cancelled) and counts as a failure. Errors that
    /// are not retryable end the series immediately.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match timeout(self.config.attempt_timeout, operation()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Ok(Err(err)) => err,
                Err(_) => Error::RemoteUnreachable(format!(
                    "attempt timed out after {:?}",
                    self.config.attempt_timeout
                )),
            };

            if !err.is_retryable() {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            if attempt >= self.config.max_attempts {
                warn!("Operation failed after {} attempts: {}", attempt, err);
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            let delay = self.config.delay_for_retry(attempt - 1);
            warn!(
                "Attempt {} failed: {}. Retrying in {:?}...",
                attempt, err, delay
            );
            sleep(delay).await;
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fixed_delay() {
        let config = RetryConfig::new(3).with_delay(Duration::from_millis(500));

        assert_eq!(config.delay_for_retry(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_retry(5), Duration::from_millis(500));
    }

    #[test]
    fn test_exponential_delay_calculation() {
        let config = RetryConfig::new(3)
            .with_delay(Duration::from_secs(1))
            .with_backoff(BackoffPolicy::Exponential {
                multiplier: 2.0,
                max_delay_ms: 60_000,
                jitter: false,
            });

        assert_eq!(config.delay_for_retry(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_retry(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_delay(Duration::from_secs(1))
            .with_backoff(BackoffPolicy::Exponential {
                multiplier: 10.0,
                max_delay_ms: 10_000,
                jitter: false,
            });

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(config.delay_for_retry(5), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryConfig::new(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let executor = RetryExecutor::default();

        let outcome = executor.execute(|| async { Ok(42) }).await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_on_remote_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let config = RetryConfig::new(3).with_delay(Duration::from_millis(1));
        let executor = RetryExecutor::new(config);

        let outcome = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(Error::RemoteUnreachable("Connection failed".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::default();

        let outcome: RetryOutcome<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::InvalidInput("bad payload".to_string()))
                }
            })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_attempts_exceeded() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let config = RetryConfig::new(3).with_delay(Duration::from_millis(1));
        let executor = RetryExecutor::new(config);

        let outcome: RetryOutcome<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::RemoteRejected {
                        status: 500,
                        message: "Always fails".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(
            outcome.result,
            Err(Error::RemoteRejected { status: 500, .. })
        ));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_cancels() {
        let config = RetryConfig::new(2)
            .with_delay(Duration::from_millis(10))
            .with_attempt_timeout(Duration::from_secs(1));
        let executor = RetryExecutor::new(config);

        let outcome: RetryOutcome<()> = executor
            .execute(|| async {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;

        assert!(matches!(outcome.result, Err(Error::RemoteUnreachable(_))));
        assert_eq!(outcome.attempts, 2);
    }
}
