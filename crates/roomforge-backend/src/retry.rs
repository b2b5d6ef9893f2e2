//! Bounded retries with exponential backoff for backend calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::BackendError;

/// How often and how patiently a transient backend failure is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based), before
    /// jitter. Doubles each time, capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// Only [`BackendError::is_retryable`] errors are retried. Up to half
    /// the backoff is added as random jitter so rooms failing together
    /// do not hammer the engine in lockstep.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let base = self.backoff_for(attempt);
                    let jitter_ms = base.as_millis() as u64 / 2;
                    let jitter = if jitter_ms > 0 {
                        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
                    } else {
                        Duration::ZERO
                    };
                    tracing::warn!(
                        op,
                        attempt,
                        max_attempts,
                        error = %e,
                        "transient backend error, retrying"
                    );
                    tokio::time::sleep(base + jitter).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
