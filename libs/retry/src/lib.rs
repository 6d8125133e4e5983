//! Retry and backoff primitives shared by the backend and cluster clients.
//!
//! Two building blocks live here:
//!
//! - [`BackoffPolicy`]: exponential delay growth with a hard cap and jitter.
//! - [`retry`] / [`sleep_or_cancel`]: bounded retry loops that stay
//!   responsive to cancellation.
//!
//! # Invariants
//!
//! - Delays never exceed `BackoffPolicy::max` (plus jitter).
//! - A canceled sleep returns immediately; the caller decides whether that
//!   ends the whole operation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound for any single delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0) applied to each delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given zero-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(16) as i32);
        let capped = exp.min(self.max.as_millis() as f64);

        let spread = capped * self.jitter;
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * spread;

        Duration::from_millis((capped + offset).max(0.0) as u64)
    }
}

/// Sleep for `duration`, waking early if `cancel` fires.
///
/// Returns `true` when the full duration elapsed and `false` when the sleep
/// was interrupted by cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Run `op` until it succeeds, the retry predicate rejects the error, or
/// `max_attempts` is exhausted.
///
/// The final error is returned unchanged, so callers keep their own error
/// types end to end.
pub async fn retry<T, E, F, Fut, P>(
    policy: &BackoffPolicy,
    max_attempts: u32,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(2));
        // Large attempt numbers must not overflow the exponent.
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_delay_jitter_stays_in_range() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(30),
            jitter: 0.5,
        };

        for _ in 0..100 {
            let d = policy.delay(0).as_millis();
            assert!((500..=1500).contains(&d), "delay {d}ms outside jitter range");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(10),
            jitter: 0.0,
        };

        let result: Result<(), &str> = retry(&policy, 3, |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("boom")
        })
        .await;

        assert_eq!(result, Err("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_respects_predicate() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::default();

        let result: Result<(), &str> = retry(&policy, 10, |e| *e != "fatal", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("fatal")
        })
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(10),
            jitter: 0.0,
        };

        let result: Result<u32, &str> = retry(&policy, 5, |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("again")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);

        let live = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_millis(1), &live).await);
    }
}
