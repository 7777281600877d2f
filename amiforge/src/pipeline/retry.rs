//! Bounded retry with multiplicative backoff.
//!
//! Wraps a single remote call that is safe to repeat. Delays grow by a fixed
//! multiplier per attempt and are capped; there is no jitter. Cancellation
//! aborts immediately, including in the middle of a backoff sleep.

use crate::cancellation::{CancellationToken, Cancelled};
use crate::errors::AmiforgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Backoff policy: `delay(n) = min(initial * multiplier^n, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Creates a backoff policy.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// Returns the delay to sleep before retry number `retry` (0-indexed).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// Error returned by [`RetryConfig::run`].
#[derive(Debug, Clone, Error)]
pub enum RetryError<E> {
    /// The token fired before the operation succeeded.
    #[error("{operation} cancelled: {}", .source.reason)]
    Cancelled {
        /// The operation being retried.
        operation: String,
        /// The cancellation that aborted it.
        source: Cancelled,
    },

    /// Retrying stopped with an error: tries exhausted or the error was not retryable.
    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        /// The operation being retried.
        operation: String,
        /// How many times the operation was invoked.
        attempts: usize,
        /// The last error observed.
        last: E,
    },
}

impl<E> RetryError<E> {
    /// Returns the last operation error, if retrying ended with one.
    #[must_use]
    pub fn into_last(self) -> Option<E> {
        match self {
            Self::Cancelled { .. } => None,
            Self::Exhausted { last, .. } => Some(last),
        }
    }
}

impl<E: fmt::Display> From<RetryError<E>> for AmiforgeError {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Cancelled { source, .. } => source.into(),
            exhausted @ RetryError::Exhausted { .. } => Self::Step(exhausted.to_string()),
        }
    }
}

/// Retry configuration: how many tries and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total invocations allowed, including the first. `0` behaves as `1`.
    pub tries: usize,
    /// Delay policy between invocations.
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            tries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    /// Creates a retry config.
    #[must_use]
    pub const fn new(tries: usize, backoff: Backoff) -> Self {
        Self { tries, backoff }
    }

    /// The policy used around `ImportImage`: 11 tries, 200ms to 30s, doubling.
    #[must_use]
    pub const fn import_image() -> Self {
        Self::new(
            11,
            Backoff::new(Duration::from_millis(200), Duration::from_secs(30), 2.0),
        )
    }

    /// Sets the number of tries.
    #[must_use]
    pub const fn with_tries(mut self, tries: usize) -> Self {
        self.tries = tries;
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Effective number of tries.
    #[must_use]
    pub const fn effective_tries(&self) -> usize {
        if self.tries == 0 {
            1
        } else {
            self.tries
        }
    }

    /// Runs `attempt` until it succeeds, the tries are exhausted, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Cancelled`] as soon as cancellation is observed and
    /// [`RetryError::Exhausted`] carrying the last error otherwise.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        attempt: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_if(cancel, operation, |_| true, attempt).await
    }

    /// Like [`RetryConfig::run`], but stops at the first error for which
    /// `retryable` returns false.
    ///
    /// # Errors
    ///
    /// See [`RetryConfig::run`].
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        retryable: P,
        mut attempt: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let tries = self.effective_tries();
        let mut attempts = 0;

        loop {
            cancel.check().map_err(|source| RetryError::Cancelled {
                operation: operation.to_string(),
                source,
            })?;

            attempts += 1;
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempts >= tries || !retryable(&err) {
                warn!(operation, attempts, error = %err, "Giving up on operation");
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts,
                    last: err,
                });
            }

            let retry = u32::try_from(attempts - 1).unwrap_or(u32::MAX);
            let delay = self.backoff.delay(retry);
            debug!(
                operation,
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Retrying after error"
            );

            cancel
                .sleep(delay)
                .await
                .map_err(|source| RetryError::Cancelled {
                    operation: operation.to_string(),
                    source,
                })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig::new(
            3,
            Backoff::new(Duration::from_millis(10), Duration::from_millis(40), 2.0),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(200), Duration::from_secs(30), 2.0);
        assert_eq!(backoff.delay(0), Duration::from_millis(200));
        assert_eq!(backoff.delay(1), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(1600));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_tries_clamped() {
        assert_eq!(RetryConfig::default().with_tries(0).effective_tries(), 1);
        assert_eq!(RetryConfig::import_image().effective_tries(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let c = calls.clone();
        let result: Result<&str, RetryError<String>> = fast()
            .run(&token, "ImportImage", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("throttled".to_string())
                    } else {
                        Ok("import-ami-1")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "import-ami-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let c = calls.clone();
        let result: Result<(), RetryError<String>> = fast()
            .run(&token, "ImportImage", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure {n}"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            RetryError::Exhausted {
                operation,
                attempts,
                last,
            } => {
                assert_eq!(operation, "ImportImage");
                assert_eq!(attempts, 3);
                assert_eq!(last, "failure 2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let c = calls.clone();
        let result: Result<(), RetryError<String>> = fast()
            .run_if(
                &token,
                "DeleteSecurityGroup",
                |e: &String| e.contains("DependencyViolation"),
                || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("AccessDenied".to_string())
                    }
                },
            )
            .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        token.cancel("interrupt");

        let c = calls.clone();
        let result: Result<(), RetryError<String>> = fast()
            .run(&token, "ImportImage", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = Arc::new(CancellationToken::new());
        let slow = RetryConfig::new(
            5,
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60), 1.0),
        );

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel("stop");
        });

        let c = calls.clone();
        let result: Result<(), RetryError<String>> = slow
            .run(&token, "ImportImage", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("nope".to_string())
                }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_into_amiforge_error() {
        let err: AmiforgeError = RetryError::Exhausted {
            operation: "ImportImage".to_string(),
            attempts: 11,
            last: "RequestLimitExceeded".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "ImportImage failed after 11 attempt(s): RequestLimitExceeded"
        );

        let err: AmiforgeError = RetryError::<String>::Cancelled {
            operation: "ImportImage".to_string(),
            source: Cancelled::new("ctrl-c"),
        }
        .into();
        assert!(err.is_cancelled());
    }
}
