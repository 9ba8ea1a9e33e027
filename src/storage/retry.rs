//! Retryable-operation abstraction shared by every storage primitive.
//!
//! Retry logic is easy to get subtly wrong (off-by-one attempt counting,
//! unbounded spinning, missing backoff), so it lives here once and is
//! parameterized over the operation instead of being re-implemented inside
//! each of get/increment/reset.

use std::future::Future;
use std::time::Duration;

use tracing::{event, Level};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always >= 1.
    pub max_attempts: usize,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    /// Linear backoff: base * number of failed attempts so far
    pub fn backoff(&self, failed_attempts: usize) -> Duration {
        self.base_backoff * failed_attempts as u32
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping between attempts.
/// The last error is returned when the budget is spent.
pub async fn with_retries<T, Op, Fut>(policy: &RetryPolicy, mut op: Op) -> Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failed_attempts = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                failed_attempts += 1;
                if failed_attempts >= policy.max_attempts {
                    return Err(err);
                }

                let backoff = policy.backoff(failed_attempts);
                event!(
                    Level::WARN,
                    "operation failed (attempt {}/{}), retrying in {:?}: {}",
                    failed_attempts,
                    policy.max_attempts,
                    backoff,
                    err
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{with_retries, RetryPolicy};
    use crate::error::Error;

    fn policy(max_attempts: usize, backoff_ms: u64) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(backoff_ms))
    }

    #[tokio::test]
    async fn first_attempt_success_does_not_retry() {
        let calls = AtomicUsize::new(0);
        let result = with_retries(&policy(3, 0), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(42)
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = with_retries(&policy(3, 100), || async {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(Error::Io {
                    reason: "transient".to_string(),
                })
            } else {
                Ok(7u64)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let err = with_retries(&policy(3, 10), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<u64, _>(Error::Io {
                reason: "down".to_string(),
            })
        })
        .await
        .err()
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::Io { reason } => assert_eq!(reason, "down"),
            _ => panic!("Unexpected error {}", err),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_linearly() {
        let start = Instant::now();
        let _ = with_retries(&policy(3, 100), || async {
            Err::<(), _>(Error::Io {
                reason: "down".to_string(),
            })
        })
        .await;

        // two sleeps: 100ms after the first failure, 200ms after the second
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(policy(0, 10).max_attempts, 1);
    }
}
