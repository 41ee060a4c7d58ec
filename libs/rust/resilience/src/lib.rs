//! Resilience utilities: bounded retry with exponential backoff.
//!
//! The attempt budget is always finite. A failing operation runs at most
//! `max_attempts` times and the caller receives the last error together with
//! the number of attempts actually made.
use std::future::Future;
use std::time::Duration;
use rand::{thread_rng, Rng};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq)]
pub enum ResilienceError {
    #[error("retry policy needs at least one attempt")]
    ZeroAttempts,
    #[error("retry jitter must be within 0.0..=1.0, got {0}")]
    JitterOutOfRange(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_attempts: 3, base_delay: Duration::from_millis(200), max_delay: Duration::from_secs(5), jitter: 0.2 } }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Result<Self, ResilienceError> {
        Self { max_attempts, base_delay, ..Default::default() }.validated()
    }

    pub fn with_jitter(mut self, jitter: f64) -> Result<Self, ResilienceError> { self.jitter = jitter; self.validated() }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self { self.max_delay = max_delay; self }

    fn validated(self) -> Result<Self, ResilienceError> {
        if self.max_attempts == 0 { return Err(ResilienceError::ZeroAttempts); }
        if !(0.0..=1.0).contains(&self.jitter) { return Err(ResilienceError::JitterOutOfRange(self.jitter)); }
        Ok(self)
    }

    /// Backoff before the attempt that follows `attempt` (0-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt.min(16)));
        exp.min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 { return delay; }
        let spread = (delay.as_millis() as f64 * self.jitter) as i64;
        let offset: i64 = thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Error returned once the attempt budget is spent or a permanent failure is hit.
#[derive(Debug)]
pub struct GaveUp<E> {
    pub attempts: u32,
    pub last: E,
}

/// Run `op` until it succeeds, `retryable` rejects its error, or the attempt
/// budget is exhausted. `op` receives the 0-based attempt index.
pub async fn retry_async<F, Fut, T, E, P>(policy: &RetryPolicy, mut op: F, retryable: P) -> Result<T, GaveUp<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => {
                if attempt > 0 { debug!(attempt = attempt + 1, "operation succeeded after retry"); }
                return Ok(v);
            }
            Err(e) if !retryable(&e) => {
                debug!(attempt = attempt + 1, error = %e, "permanent failure, not retrying");
                return Err(GaveUp { attempts: attempt + 1, last: e });
            }
            Err(e) if attempt + 1 >= policy.max_attempts => {
                warn!(attempts = attempt + 1, error = %e, "retry budget exhausted");
                return Err(GaveUp { attempts: attempt + 1, last: e });
            }
            Err(e) => {
                let delay = policy.jittered(attempt);
                warn!(attempt = attempt + 1, max_attempts = policy.max_attempts, delay_ms = delay.as_millis() as u64, error = %e, "attempt failed, backing off");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}
