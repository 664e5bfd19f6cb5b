//! Retry executor with exponential backoff.
//!
//! `with_retry` runs an operation up to `1 + max_retries` times, waiting
//! between attempts through the injected [`Clock`]. Exhaustion is reported as
//! a value ([`RetryExhausted`]) rather than an error so callers can record how
//! many attempts were spent before deciding what the failure means.

use std::future::Future;
use std::time::Duration;

use opsflow_types::workflow::RetryPolicy;

use super::clock::Clock;

/// Backoff schedule derived from a [`RetryPolicy`].
pub trait Backoff {
    /// Wait before retry number `attempt` (0-based: 0 is the wait after the
    /// first failure).
    fn delay_for(&self, attempt: u32) -> Duration;
}

impl Backoff for RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut ms = self.backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        if self.jitter {
            // 0.8x to 1.2x
            ms *= 0.8 + rand::random::<f64>() * 0.4;
        }
        let capped = ms.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Successful outcome and the attempts it took (1-based).
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Last error after every attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted<E> {
    pub error: E,
    pub attempts: u32,
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 1-based attempt number.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut op: F,
) -> Result<Retried<T>, RetryExhausted<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_retries.saturating_add(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) if attempt >= max_attempts => {
                return Err(RetryExhausted {
                    error,
                    attempts: attempt,
                });
            }
            Err(error) => {
                let backoff = policy.delay_for(attempt - 1);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "retrying after failure"
                );
                clock.sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
