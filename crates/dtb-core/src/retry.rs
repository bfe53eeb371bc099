//! Exponential backoff with jitter around any fallible async call.
//!
//! Shared by the REST API client, the Bot API messenger and anything else that
//! talks to a flaky remote. Each caller brings its own [`RetryPolicy`] and its
//! own classifier deciding which failures are worth another attempt.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

/// Upper bound of the jitter, as a fraction of the computed delay.
const JITTER_RATIO: f64 = 0.3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always >= 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before jitter for a 1-based `attempt`: `min(max_delay, base_delay * 2^(attempt-1))`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`Self::backoff`] plus uniform jitter in `[0, 0.3 * backoff)`, floored to whole ms.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.backoff(attempt).as_millis() as f64;
        let jitter_ms = rand::thread_rng().gen::<f64>() * JITTER_RATIO * base_ms;
        Duration::from_millis((base_ms + jitter_ms).floor() as u64)
    }
}

/// What to do with a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Propagate the error as-is.
    Fail,
    /// Retry after the policy's computed delay.
    Retry,
    /// Retry after a server-provided delay (e.g. Bot API `retry_after`).
    RetryAfter(Duration),
}

#[derive(Clone, Copy, Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, `classify` rejects the error, or attempts run out.
    ///
    /// Never mutates shared state; the only side effects are sleeps and one
    /// warning per retry.
    pub async fn run<T, E, F, Fut, C>(&self, label: &str, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> RetryDecision,
        E: Display,
    {
        let mut attempt = 1u32;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts {
                return Err(err);
            }
            let delay = match classify(&err) {
                RetryDecision::Fail => return Err(err),
                RetryDecision::Retry => self.policy.delay(attempt),
                RetryDecision::RetryAfter(d) => d,
            };

            warn!(
                operation = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "request failed, retrying"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}
