//! Jittered exponential backoff for store retries.
//!
//! Callers own the loop and the attempt counter; the policy only answers
//! whether another attempt is allowed and how long to wait before it.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};
use crate::metrics::PodiumMetrics;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);

/// Default ceiling for a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

/// Retry policy for throttled or conflicting store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for any single delay, before jitter.
    pub max_delay: Duration,
    /// Total attempts allowed, or `None` to retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// A policy that retries forever.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: None,
        }
    }

    /// A policy that gives up after `max_attempts` total attempts.
    #[must_use]
    pub const fn bounded(max_attempts: u32) -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: Some(max_attempts),
        }
    }

    /// Overrides the delay range (builder style).
    #[must_use]
    pub const fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Returns true if another attempt may follow `attempts_made` attempts.
    #[must_use]
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }

    /// Returns the delay to wait after the given (1-based) failed attempt.
    ///
    /// The un-jittered delay doubles per attempt up to `max_delay`; the result
    /// is drawn uniformly from the upper half of that delay.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);
        let half = ceiling / 2;
        half + jitter(ceiling - half)
    }

    /// Sleeps for the backoff delay of the given failed attempt.
    pub async fn backoff(&self, attempt: u32) {
        tokio::time::sleep(self.delay_for(attempt)).await;
    }
}

/// Runs a store call, retrying it while the backend reports throttling.
///
/// # Errors
///
/// Returns the first non-throttling error, or [`Error::RetriesExhausted`] once
/// the policy stops allowing retries.
pub async fn retry_throttled<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = podium_core::Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_throttled() => {
                PodiumMetrics::new().record_throttle(operation);
                if !policy.allows_retry(attempts) {
                    return Err(Error::RetriesExhausted {
                        operation: operation.into(),
                        attempts,
                    });
                }
                tracing::debug!(operation, attempts, "throttled, backing off");
                policy.backoff(attempts).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Returns a uniformly random duration in `[0, upper]`.
pub(crate) fn jitter(upper: Duration) -> Duration {
    if upper.is_zero() {
        return Duration::ZERO;
    }
    let nanos = u64::try_from(upper.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_always_allows() {
        let policy = RetryPolicy::unbounded();
        assert!(policy.allows_retry(0));
        assert!(policy.allows_retry(u32::MAX));
    }

    #[test]
    fn bounded_stops_at_limit() {
        let policy = RetryPolicy::bounded(3);
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::unbounded()
            .with_delays(Duration::from_millis(100), Duration::from_millis(400));

        for _ in 0..50 {
            let first = policy.delay_for(1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));

            let third = policy.delay_for(3);
            assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));

            let late = policy.delay_for(30);
            assert!(late <= Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn retry_throttled_retries_until_success() {
        let policy = RetryPolicy::unbounded().with_delays(Duration::ZERO, Duration::ZERO);
        let mut calls = 0;
        let value = retry_throttled(&policy, "get", || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(podium_core::Error::throttled("read capacity"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("eventually succeeds");
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn retry_throttled_gives_up_when_bounded() {
        let policy = RetryPolicy::bounded(2).with_delays(Duration::ZERO, Duration::ZERO);
        let err = retry_throttled(&policy, "query", || async {
            Err::<(), _>(podium_core::Error::throttled("read capacity"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn retry_throttled_propagates_fatal_errors() {
        let policy = RetryPolicy::unbounded();
        let err = retry_throttled(&policy, "get", || async {
            Err::<(), _>(podium_core::Error::storage("access denied"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Core(_)));
    }

    #[test]
    fn zero_delays_never_sleep() {
        let policy = RetryPolicy::bounded(2).with_delays(Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.delay_for(5), Duration::ZERO);
    }
}
