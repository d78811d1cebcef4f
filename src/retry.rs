use std::thread;
use std::time::Duration;

use crate::error::KiraError;

/// Bounded retry schedule for network calls.
///
/// `max_attempts` counts the first try, so a policy built from
/// `retry_count = 3` performs at most four requests. The delay before retry
/// `n` (1-based) grows linearly: `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: retry_count.saturating_add(1),
            base_delay,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(retry.max(1))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `on_retry` sees the retry number, the delay
    /// about to be slept and the error that caused it.
    ///
    /// On failure returns the last error together with the number of attempts made.
    pub fn run<T, F, R>(&self, mut op: F, mut on_retry: R) -> Result<T, (KiraError, u32)>
    where
        F: FnMut() -> Result<T, KiraError>,
        R: FnMut(u32, Duration, &KiraError),
    {
        let mut attempt = 1u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    on_retry(attempt, delay, &err);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}
