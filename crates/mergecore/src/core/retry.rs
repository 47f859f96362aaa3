//! Bounded, cancellable retries for transfers: staging downloads and
//! deliveries of merged outputs.
//!
//! Delays double from `initial_delay` up to `max_delay`, with up to 25%
//! jitter. A `retry_after` hint from the failing side replaces the backoff
//! for that attempt. Cancellation ends an attempt or a wait at once.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The last error was permanent, or the retry budget ran out
    #[error("gave up after {attempts} attempt(s)")]
    GaveUp { attempts: u32, last_error: E },

    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Collapses into the operation's own error type.
    pub fn into_error(self, cancelled: impl FnOnce() -> E) -> E {
        match self {
            RetryError::GaveUp { last_error, .. } => last_error,
            RetryError::Cancelled => cancelled(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy for network transfers, with the retry budget from settings.
    pub fn transfers(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Backoff before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        if self.jitter {
            Duration::from_secs_f64(capped + rand::random::<f64>() * 0.25 * capped)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

/// Classifies failures for [`retry_until_cancelled`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Wait requested by the other side (flood control, `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::TimedOut | ErrorKind::Interrupted
        )
    }
}

impl Retryable for reqwest::Error {
    fn is_retryable(&self) -> bool {
        if self.is_timeout() || self.is_connect() || self.is_request() {
            return true;
        }
        self.status()
            .is_some_and(|s| s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS)
    }
}

/// Runs `operation` until it succeeds, fails permanently, exhausts
/// `policy`, or `cancel` fires.
pub async fn retry_until_cancelled<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            res = operation() => res,
        };

        let error = match outcome {
            Ok(value) => {
                if attempts > 1 {
                    log::info!("Succeeded on attempt {}", attempts);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if attempts > policy.max_retries || !error.is_retryable() {
            return Err(RetryError::GaveUp {
                attempts,
                last_error: error,
            });
        }

        let delay = error.retry_after().unwrap_or_else(|| policy.backoff(attempts - 1));
        log::warn!(
            "Attempt {}/{} failed, retrying in {:?}: {}",
            attempts,
            policy.max_retries + 1,
            delay,
            error
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    struct Flaky {
        transient: bool,
        wait: Option<Duration>,
    }

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (transient: {})", self.transient)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.transient
        }

        fn retry_after(&self) -> Option<Duration> {
            self.wait
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let result = retry_until_cancelled(&policy(3), &CancellationToken::new(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Flaky {
                    transient: true,
                    wait: None,
                })
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_is_never_exceeded() {
        let calls = &AtomicU32::new(0);
        let result = retry_until_cancelled(&policy(2), &CancellationToken::new(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Flaky {
                transient: true,
                wait: None,
            })
        })
        .await;

        assert!(matches!(result, Err(RetryError::GaveUp { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let calls = &AtomicU32::new(0);
        let result = retry_until_cancelled(&policy(5), &CancellationToken::new(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Flaky {
                transient: false,
                wait: None,
            })
        })
        .await;

        let err = result.unwrap_err().into_error(|| unreachable!());
        assert!(!err.transient);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_after_overrides_backoff() {
        let started = std::time::Instant::now();
        let calls = &AtomicU32::new(0);
        let long_backoff = RetryPolicy {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            ..policy(1)
        };
        let result = retry_until_cancelled(&long_backoff, &CancellationToken::new(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Flaky {
                    transient: true,
                    wait: Some(Duration::from_millis(10)),
                })
            } else {
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let slow = RetryPolicy {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            ..policy(5)
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = retry_until_cancelled(&slow, &cancel, || async move {
            Err::<(), _>(Flaky {
                transient: true,
                wait: None,
            })
        })
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            ..policy(5)
        };
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(8));
        assert_eq!(p.backoff(4), Duration::from_secs(10));
    }

    #[test]
    fn test_transfer_policy_takes_budget_from_settings() {
        let p = RetryPolicy::transfers(4);
        assert_eq!(p.max_retries, 4);
        assert!(p.jitter);
    }
}
