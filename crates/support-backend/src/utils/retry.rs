//! Single retry/backoff policy used by every I/O adapter (Embedding Gateway,
//! LLM Gateway, Vector Store Gateway) instead of ad-hoc retry loops at each
//! call site. Grounded in `utils::limiters::Limiters::acquire_timed`'s use of
//! `tokio::time::timeout` for bounding I/O, generalized with jittered backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let millis = if self.jitter && capped > 0 {
            rand::rng().random_range(0..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

/// Retries `op` up to `policy.attempts` times, sleeping with exponential
/// (optionally jittered) backoff between attempts. `is_retryable` decides
/// whether a given error is worth retrying at all: boundary validation
/// errors must return `false` so they fail fast.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 0..policy.attempts.max(1) {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !is_retryable(&e) || attempt + 1 == policy.attempts {
                    return Err(e);
                }
                last_err = Some(e);
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }
    // Unreachable when attempts >= 1, kept for exhaustiveness.
    Err(last_err.expect("retry loop always records an error before falling through"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let result: Result<i32, &str> = retry_with_backoff(policy, |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<i32, &str> = retry_with_backoff(policy, |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boundary error") }
        })
        .await;
        assert_eq!(result, Err("boundary error"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
