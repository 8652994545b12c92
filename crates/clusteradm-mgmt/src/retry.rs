//! Retry logic with exponential backoff for admin RPCs.
//!
//! Every attempt runs under its own deadline. Only transient failures
//! (an instance that is still starting, a timed-out attempt) are retried;
//! a permanently unreachable instance fails on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{AdminError, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first (default: 3).
    pub max_retries: u32,
    /// Deadline of each attempt (default: 5 seconds).
    pub attempt_timeout: Duration,
    /// Initial backoff duration (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 2 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// Operation succeeded.
    Success(T),
    /// All retries exhausted, or the error was permanent.
    Exhausted {
        /// The last error that occurred.
        last_error: AdminError,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T> RetryOutcome<T> {
    /// Collapses the outcome into the last error on failure.
    pub fn into_result(self) -> Result<T> {
        match self {
            RetryOutcome::Success(value) => Ok(value),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Executor for retried operations.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation`, retrying transient failures with backoff.
    ///
    /// `what` names the call in logs and timeout errors.
    pub async fn execute<F, Fut, T>(&self, what: &str, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let result = match tokio::time::timeout(self.config.attempt_timeout, operation()).await
            {
                Ok(result) => result,
                Err(_) => Err(AdminError::Timeout {
                    operation: what.to_string(),
                    after_ms: self.config.attempt_timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(value) => return RetryOutcome::Success(value),
                Err(e) => {
                    if !is_retryable(&e) || attempt > self.config.max_retries {
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }
                    let backoff = self.compute_backoff(attempt - 1);
                    debug!(call = what, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Shorthand for `execute(..).await.into_result()`.
    pub async fn run<F, Fut, T>(&self, what: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(what, operation).await.into_result()
    }

    /// Single attempt under the per-attempt deadline, for calls that are not
    /// safe to repeat.
    pub async fn once<Fut, T>(&self, what: &str, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.attempt_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(AdminError::Timeout {
                operation: what.to_string(),
                after_ms: self.config.attempt_timeout.as_millis() as u64,
            }),
        }
    }

    /// `initial_backoff * backoff_multiplier^attempt`, capped at `max_backoff`,
    /// plus up to 50% random jitter.
    fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.config.initial_backoff.as_millis() as f64;
        let max_delay_ms = self.config.max_backoff.as_millis() as f64;

        let computed = base_delay_ms * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(max_delay_ms) as u64;

        if self.config.jitter && capped > 1 {
            let jitter_ms = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// True for failures that may clear up on their own.
pub fn is_retryable(error: &AdminError) -> bool {
    error.is_transient()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            attempt_timeout: Duration::from_millis(50),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn starting() -> AdminError {
        AdminError::Connection {
            address: "db1:3306".to_string(),
            message: "server is starting".to_string(),
            transient: true,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
        assert!(config.jitter);
    }

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&starting()));
        assert!(is_retryable(&AdminError::Timeout {
            operation: "probe".to_string(),
            after_ms: 10
        }));
        assert!(!is_retryable(&AdminError::unreachable("db1:3306", "gone")));
        assert!(!is_retryable(&AdminError::State("x".to_string())));
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let executor = RetryExecutor::new(quick());
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome = executor
            .execute("probe", move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                    if count < 3 {
                        Err(starting())
                    } else {
                        Ok("ready")
                    }
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Success("ready")));
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let executor = RetryExecutor::new(quick());
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let outcome: RetryOutcome<()> = executor
            .execute("probe", move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(starting())
                }
            })
            .await;

        match outcome {
            RetryOutcome::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
            RetryOutcome::Success(_) => panic!("expected exhaustion"),
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let executor = RetryExecutor::new(quick());
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = Arc::clone(&counter);
        let result: Result<()> = executor
            .run("leave", move || {
                let counter = Arc::clone(&counter_clone);
                async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Err(AdminError::unreachable("db1:3306", "no route to host"))
                }
            })
            .await;

        assert!(result.unwrap_err().is_unreachable());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_becomes_timeout_error() {
        let executor = RetryExecutor::new(RetryConfig {
            max_retries: 0,
            ..quick()
        });
        let result: Result<()> = executor
            .run("join", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AdminError::Timeout { .. })));
    }

    #[test]
    fn test_compute_backoff() {
        let executor = RetryExecutor::new(RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            jitter: false,
            ..RetryConfig::default()
        });
        assert_eq!(executor.compute_backoff(0), Duration::from_millis(100));
        assert_eq!(executor.compute_backoff(1), Duration::from_millis(200));
        assert_eq!(executor.compute_backoff(5), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let executor = RetryExecutor::new(RetryConfig {
            initial_backoff: Duration::from_millis(100),
            jitter: true,
            ..RetryConfig::default()
        });
        for _ in 0..50 {
            let d = executor.compute_backoff(0);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }
}
