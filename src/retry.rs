// SPDX-License-Identifier: MIT
//! Exponential backoff for external calls.
//!
//! [`retry_with_backoff`] retries a fallible async operation with
//! exponentially increasing delays. [`RetryConfig::delay_for_attempt`]
//! exposes the bare delay curve — the sync channel drives its reconnect
//! loop off the same arithmetic instead of duplicating it.

use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first try.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Multiplier applied to the previous delay on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config for unit tests — no real waiting.
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// Delay to sleep before retry number `attempt` (1-based: attempt 1 is
    /// the first *retry*). Exponential in `multiplier`, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1).min(63) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Retry an async operation with exponential backoff.
///
/// Calls `f()` up to `config.max_attempts` times, sleeping the configured
/// delay between failures. Returns the first success, or the last error
/// once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    assert!(
        config.max_attempts > 0,
        "RetryConfig.max_attempts must be at least 1"
    );

    let mut last_err: Option<E> = None;

    for attempt in 1..=config.max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt < config.max_attempts {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        err = ?e,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }

    // Safety: max_attempts >= 1, so the loop ran and last_err is set.
    Err(last_err.expect("retry loop ended without setting last_err"))
}
