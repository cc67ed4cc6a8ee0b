//! Retrying-call abstraction shared by every upstream request.
//!
//! Two failure classes are tracked separately: rate limiting is expected in
//! steady state and retried without limit, while transient failures consume a
//! bounded attempt budget with exponential backoff.

use std::{fmt::Display, future::Future, num::NonZeroU32, time::Duration};

use metrics::counter;
use tracing::warn;

const METRIC_UPSTREAM_RETRY_TOTAL: &str = "leadcache_upstream_retry_total";

/// Classification of one failed attempt.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Upstream asked us to slow down (HTTP 429).
    RateLimited { retry_after: Option<Duration> },
    /// Worth retrying: timeouts, connection resets, 5xx.
    Transient(E),
    /// Retrying will not help.
    Permanent(E),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first call included, for transient failures.
    pub max_attempts: NonZeroU32,
    pub base_delay: Duration,
    pub rate_limit_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(5).unwrap_or(NonZeroU32::MIN),
            base_delay: Duration::from_millis(500),
            rate_limit_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive transient failure.
    pub fn transient_backoff(&self, failures: u32) -> Duration {
        exponential(self.base_delay, failures, self.max_delay)
    }

    /// Delay after the `hits`-th rate-limit response, never shorter than the
    /// server-provided hint.
    pub fn rate_limit_backoff(&self, hits: u32, retry_after: Option<Duration>) -> Duration {
        let computed = exponential(self.rate_limit_delay, hits, self.max_delay);
        match retry_after {
            Some(hint) => computed.max(hint.min(self.max_delay)),
            None => computed,
        }
    }

    /// Drive `op` until it succeeds, fails permanently, or exhausts the
    /// transient budget. Rate-limited attempts never count against the budget.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError<E>>>,
    {
        let mut transient_failures = 0u32;
        let mut rate_limited = 0u32;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Permanent(err)) => return Err(err),
                Err(AttemptError::RateLimited { retry_after }) => {
                    rate_limited = rate_limited.saturating_add(1);
                    let delay = self.rate_limit_backoff(rate_limited, retry_after);
                    counter!(METRIC_UPSTREAM_RETRY_TOTAL, "class" => "rate_limited").increment(1);
                    warn!(
                        target = "leadcache::upstream::retry",
                        call = label,
                        hits = rate_limited,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Transient(err)) => {
                    transient_failures = transient_failures.saturating_add(1);
                    if transient_failures >= self.max_attempts.get() {
                        warn!(
                            target = "leadcache::upstream::retry",
                            call = label,
                            attempts = transient_failures,
                            error = %err,
                            "giving up after exhausting retry budget"
                        );
                        return Err(err);
                    }

                    let delay = self.transient_backoff(transient_failures);
                    counter!(METRIC_UPSTREAM_RETRY_TOTAL, "class" => "transient").increment(1);
                    warn!(
                        target = "leadcache::upstream::retry",
                        call = label,
                        attempt = transient_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient upstream failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn exponential(base: Duration, step: u32, cap: Duration) -> Duration {
    let exponent = step.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(cap)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: NonZeroU32::new(max_attempts).expect("non-zero"),
            base_delay: Duration::from_millis(1),
            rate_limit_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn transient_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.transient_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.transient_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.transient_backoff(3), Duration::from_millis(350));
        assert_eq!(policy.transient_backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_backoff_honors_longer_hint() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.rate_limit_backoff(1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(policy.rate_limit_backoff(1, None), Duration::from_secs(2));
        assert_eq!(policy.rate_limit_backoff(2, None), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn rate_limit_then_success_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<&str, String> = fast_policy(1)
            .run("test", || {
                let counter = counter.clone();
                async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0 => Err(AttemptError::RateLimited { retry_after: None }),
                        _ => Ok("payload"),
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("payload"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limits_do_not_consume_transient_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, String> = fast_policy(2)
            .run("test", || {
                let counter = counter.clone();
                async move {
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0..=5 => Err(AttemptError::RateLimited { retry_after: None }),
                        6 => Err(AttemptError::Transient("reset".to_string())),
                        n => Ok(n),
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn transient_failures_stop_at_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), String> = fast_policy(3)
            .run("test", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::Transient("timeout".to_string()))
                }
            })
            .await;

        assert_eq!(result, Err("timeout".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), String> = fast_policy(5)
            .run("test", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::Permanent("unauthorized".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
