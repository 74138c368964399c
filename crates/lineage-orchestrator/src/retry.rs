//! Fixed-backoff retry for idempotent remote calls.

use std::future::Future;
use std::time::Duration;

use lineage_core::config::WaitSettings;
use tokio::time::Instant;
use tracing::warn;

/// Fixed backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay between two attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(wait: &WaitSettings) -> Self {
        Self {
            max_attempts: wait.retry_attempts.max(1),
            delay: wait.retry_delay(),
        }
    }

    /// A policy that makes exactly one attempt.
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1` (0-indexed). Constant.
    pub const fn delay_for_attempt(&self, _attempt: u32) -> Duration {
        self.delay
    }

    /// Whether another attempt should be made after `attempt` attempts.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds or the attempt budget is spent. Returns the
    /// last error.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_until(operation, None, op).await
    }

    /// Like [`run`](Self::run), but no retry delay extends past `deadline`.
    /// A failure at or after the deadline is returned without retrying.
    pub async fn run_until<T, E, F, Fut>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if self.should_retry(attempt) => {
                    let mut delay = self.delay_for_attempt(attempt);
                    if let Some(deadline) = deadline {
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(e);
                        }
                        delay = delay.min(deadline - now);
                    }
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Remote call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(5));
    }

    #[test]
    fn from_settings_never_below_one_attempt() {
        let wait = WaitSettings {
            retry_attempts: 0,
            retry_delay_ms: 250,
            ..WaitSettings::default()
        };
        let policy = RetryPolicy::from_settings(&wait);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay, Duration::from_millis(250));
    }

    #[test]
    fn should_retry_bounds() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, String> = RetryPolicy::default()
            .run("test", || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("fail {n}")) } else { Ok(n) }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = RetryPolicy::default()
            .run("test", || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("fail {n}"))
            })
            .await;
        assert_eq!(result.unwrap_err(), "fail 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delay_stops_at_deadline() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();
        let deadline = started + Duration::from_millis(300);

        let result: Result<(), String> = RetryPolicy::default()
            .run_until("test", Some(deadline), || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }
}
