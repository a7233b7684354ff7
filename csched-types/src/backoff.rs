//! Shared exponential-backoff retry helper (spec §7: "base 500 ms, factor
//! 2, cap 8 s, max 5 attempts") used by every component that calls an
//! external collaborator: the oracle (C3), the forecast provider (C4), the
//! deployer (C8), and the delayed-task queue (C9).

use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2,
            cap: Duration::from_secs(8),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base.saturating_mul(self.factor.saturating_pow(attempt));
        scaled.min(self.cap)
    }
}

/// Retry `f` up to `policy.max_attempts` times with exponential backoff
/// between attempts. Returns the last error if every attempt fails.
/// `is_retryable` distinguishes transient errors (retry) from permanent
/// ones (fail immediately, spec §7 "permanent extraction failure skips the
/// function without aborting the cycle").
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: BackoffPolicy,
    mut is_retryable: impl FnMut(&E) -> bool,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts || !is_retryable(&err) {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_then_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            factor: 1,
            cap: Duration::from_millis(1),
            max_attempts: 5,
        };
        let result: Result<u32, &str> = retry_with_backoff(
            policy,
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            factor: 1,
            cap: Duration::from_millis(1),
            max_attempts: 3,
        };
        let result: Result<u32, &str> =
            retry_with_backoff(policy, |_| true, || async { Err("still failing") }).await;
        assert_eq!(result, Err("still failing"));
    }

    #[tokio::test]
    async fn permanent_error_does_not_retry() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::default();
        let result: Result<u32, &str> = retry_with_backoff(
            policy,
            |_| false,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("permanent") }
            },
        )
        .await;
        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
