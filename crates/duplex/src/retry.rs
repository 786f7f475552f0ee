//! Exponential backoff and the retry loop around adapter calls
//!
//! Adapters report failures with a retryable flag and never retry on their
//! own. Callers wrap each adapter call in [`with_retries`], which retries
//! transient failures with bounded exponential backoff and returns the final
//! outcome together with the number of attempts made.

use duplex_core::{observe, BackendResult, DuplexConfig};
use std::future::Future;
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

/// `base * factor^attempt`, capped at `max`, minus up to `jitter` of itself.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Fraction of the delay that may be shaved off, 0.0 - 1.0
    pub jitter: f64,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&DuplexConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &DuplexConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            factor: config.backoff_factor,
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: config.backoff_jitter,
            max_retries: config.max_retries,
        }
    }

    /// Policy with no sleeping, for tests and tight loops.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base: Duration::ZERO,
            factor: 1.0,
            max: Duration::ZERO,
            jitter: 0.0,
            max_retries,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.base.as_millis() as f64 * exp;
        let max_millis = self.max.as_millis() as f64;
        if !millis.is_finite() || millis >= max_millis {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// [`delay`](Self::delay) with deterministic jitter derived from `seed`.
    ///
    /// Different seeds spread out; the same seed and attempt always yield the
    /// same delay.
    pub fn delay_with_jitter(&self, attempt: u32, seed: &str) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let mut key = Vec::with_capacity(seed.len() + 4);
        key.extend_from_slice(seed.as_bytes());
        key.extend_from_slice(&attempt.to_le_bytes());
        let unit = xxh3_64(&key) as f64 / u64::MAX as f64;
        delay.mul_f64(1.0 - self.jitter.min(1.0) * unit)
    }
}

/// Final result of a retried adapter call.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: BackendResult<T>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up.
///
/// `store` labels log lines and metrics; `seed` feeds the jitter.
pub async fn with_retries<T, F, Fut>(
    policy: &BackoffPolicy,
    store: &'static str,
    seed: &str,
    mut op: F,
) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts,
                }
            }
            Err(e) if e.is_retryable() && attempts <= policy.max_retries => {
                let delay = policy.delay_with_jitter(attempts - 1, seed);
                tracing::debug!(
                    store,
                    key = seed,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after {}",
                    e
                );
                observe::record_retry(store);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => {
                return Retried {
                    result: Err(e),
                    attempts,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::BackendError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(50),
            factor: 2.0,
            max: Duration::from_millis(300),
            jitter: 0.0,
            max_retries: 5,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
        assert_eq!(policy.delay(200), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_is_bounded_and_deterministic() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1000),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.25,
            max_retries: 5,
        };
        for attempt in 0..5 {
            let full = policy.delay(attempt);
            let jittered = policy.delay_with_jitter(attempt, "users/u1");
            assert!(jittered <= full);
            assert!(jittered >= full.mul_f64(0.75));
            assert_eq!(jittered, policy.delay_with_jitter(attempt, "users/u1"));
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let out = with_retries(&BackoffPolicy::immediate(3), "secondary", "k", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BackendError::transient("reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out.result.unwrap(), 2);
        assert_eq!(out.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let out: Retried<()> = with_retries(&BackoffPolicy::immediate(2), "primary", "k", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::unavailable("down")) }
        })
        .await;
        assert!(out.result.is_err());
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Retried<()> = with_retries(&BackoffPolicy::immediate(5), "primary", "k", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::revision_conflict(None)) }
        })
        .await;
        assert!(out.result.is_err());
        assert_eq!(out.attempts, 1);
    }
}
