//! Retrying transient database failures.

use crate::error::{DbError, DbResult};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::warn;

/// Exponential backoff for operations failing with retryable errors.
///
/// The wait after attempt `n` is `initial_wait * exp_base^(n-1)`, capped at
/// `max_wait`. Retrying stops after `max_attempts` or once `max_elapsed` has
/// passed, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_elapsed: Duration,
    pub initial_wait: Duration,
    pub exp_base: f64,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_elapsed: Duration::from_secs(5),
            initial_wait: Duration::from_secs(1),
            exp_base: 1.5,
            max_wait: Duration::from_secs(6),
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the operation exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    /// Wait before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.exp_base.powi(attempt.saturating_sub(1) as i32);
        self.initial_wait.mul_f64(factor).min(self.max_wait)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// policy gives up. The last error is returned.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err: DbError = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }
            let wait = self.backoff(attempt);
            if started.elapsed() + wait > self.max_elapsed {
                return Err(err);
            }
            warn!(
                operation,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Retrying after transient failure"
            );
            sleep(wait).await;
        }
    }
}
