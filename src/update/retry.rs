//! Conflict retry for read-modify-write updates
//!
//! Only optimistic-concurrency conflicts are retried. Every other error is
//! returned on the spot, and a conflict that outlives the attempt budget
//! becomes `UpdateError::RetriesExhausted`.

use super::UpdateError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Backoff for conflict retries
///
/// Defaults: 5 attempts starting 10ms apart, doubling each time up to 1s,
/// plus up to 10% jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Extra random delay as a fraction of the current delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// Delay before the attempt after one that waited `delay`, without jitter
    pub fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict, or the budget is spent
///
/// The operation must re-read the object each time; a conflict means the copy
/// it mutated was stale.
pub async fn retry_on_conflict<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, UpdateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpdateError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_conflict() => return Err(e),
            Err(e) if attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Conflict persisted after max retries"
                );
                return Err(UpdateError::RetriesExhausted {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    last: e.to_string(),
                });
            }
            Err(e) => {
                let jitter = if policy.jitter > 0.0 {
                    rand::thread_rng().gen_range(0.0..policy.jitter)
                } else {
                    0.0
                };
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter));

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Update conflicted, retrying with a fresh copy"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = policy.next_delay(delay);
            }
        }
    }
}
