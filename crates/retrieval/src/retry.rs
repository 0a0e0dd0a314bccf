use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Bounded retry with exponential backoff and jitter.
///
/// Delay before attempt `n` (counting from the second attempt) is
/// `backoff_ms * 2^(n-1)` plus a uniform jitter in `[0, backoff_ms)` so
/// concurrent callers hitting the same outage do not retry in lockstep.
/// Attempts are hard-capped; there is no unbounded retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_ms,
        }
    }

    /// Run `op` until it succeeds or the attempt budget is spent, returning
    /// the last error when every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last_err = None;
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.delay_for(attempt)).await;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "{what} failed"
                    );
                    last_err = Some(err);
                }
            }
        }
        // max_attempts >= 1, so at least one attempt ran and failed.
        Err(last_err.unwrap())
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        let jitter = if self.backoff_ms > 0 {
            rand::rng().random_range(0..self.backoff_ms)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}
