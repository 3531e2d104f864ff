//! Bounded retry with a fixed interval between attempts.

use std::future::Future;
use std::time::Duration;

/// How many times an operation is attempted and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// A single attempt, no retries.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds, `should_retry` rejects the error, or the attempt budget is
    /// spent. `op` receives the zero-based attempt number. Blocks the calling thread while
    /// sleeping.
    pub fn retry<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        mut should_retry: impl FnMut(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts.max(1) || !should_retry(&err) {
                        return Err(err);
                    }
                    if !self.interval.is_zero() {
                        std::thread::sleep(self.interval);
                    }
                }
            }
        }
    }

    /// Async counterpart of [`RetryPolicy::retry`]; sleeps on the tokio timer.
    pub async fn retry_async<T, E, F, Fut>(
        &self,
        mut op: F,
        mut should_retry: impl FnMut(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts.max(1) || !should_retry(&err) {
                        return Err(err);
                    }
                    if !self.interval.is_zero() {
                        tokio::time::sleep(self.interval).await;
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

#[cfg(test)]
mod tests {
    use super::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn stops_after_max_attempts() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let res: Result<(), &str> = policy.retry(
            |_| {
                calls += 1;
                Err("nope")
            },
            |_| true,
        );
        assert_eq!(res, Err("nope"));
        assert_eq!(calls, 5);
    }

    #[test]
    fn non_retryable_error_fails_on_first_attempt() {
        let policy = RetryPolicy::new(100, Duration::from_secs(60));
        let mut calls = 0;
        let res: Result<(), &str> = policy.retry(
            |_| {
                calls += 1;
                Err("fatal")
            },
            |_| false,
        );
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn returns_first_success() {
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let res: Result<u32, ()> = policy.retry(
            |attempt| if attempt == 3 { Ok(attempt) } else { Err(()) },
            |_| true,
        );
        assert_eq!(res, Ok(3));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn async_retry_sleeps_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(10));
        let start = tokio::time::Instant::now();
        let res: Result<(), ()> = policy.retry_async(|_| async { Err(()) }, |_| true).await;
        assert!(res.is_err());
        // Two sleeps between three attempts.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(30), "elapsed {elapsed:?}");
    }
}
