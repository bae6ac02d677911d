//! Bounded retry of single, idempotent coordination operations.
//!
//! Only transient failures (connection loss, timeout) are retried. Anything
//! else, including an expired session, is returned on the first attempt.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 50% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Retries without sleeping; used by tests driving the in-memory namespace.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Exponential backoff, doubling from `initial_delay` and capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay);
        if self.jitter {
            let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
            base + Duration::from_millis(extra)
        } else {
            base
        }
    }
}

/// Run `f` until it succeeds, fails with a non-transient error, or the policy
/// runs out of attempts.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(op, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(op, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Transient failure, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DistError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_half() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(75));
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DistError::ConnectionLoss)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::immediate(2), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DistError::Timeout)
        })
        .await;
        assert!(matches!(result, Err(DistError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryPolicy::immediate(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(DistError::SessionExpired)
        })
        .await;
        assert!(matches!(result, Err(DistError::SessionExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
