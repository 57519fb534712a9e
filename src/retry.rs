//! Backoff and retry utilities.
//!
//! [`BackoffPolicy`] paces reconnection attempts of the stream supervisor.
//! [`RetryPolicy`] bounds retries of short request/response calls such as
//! the login handshake.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Delay schedule applied between consecutive reconnection attempts.
///
/// The default is [`BackoffPolicy::none`]: reconnect immediately.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect. Zero disables backoff entirely.
    pub initial: Duration,
    /// Upper bound for exponential growth.
    pub max: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl BackoffPolicy {
    /// Reconnects without any delay.
    pub const fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Doubles the delay on every consecutive failure, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: Duration::ZERO,
        }
    }

    /// Adds up to `jitter` of random delay to every step.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the delay before reconnect number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        exponential_delay(self.initial, self.max, attempt) + jitter_duration(self.jitter, attempt)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Policy controlling retry attempts of a single request.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// A small retry budget suited to interactive API calls.
    pub fn interactive() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            jitter: Duration::from_millis(50),
        }
    }

    /// Never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based and should correspond to the current attempt index.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        exponential_delay(self.initial_backoff, self.max_backoff, attempt)
            + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number. `should_retry` decides whether
/// an error is worth another attempt.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt >= max_attempts || !should_retry(&error) => return Err(error),
            Err(_) => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "request_retry_scheduled",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

fn exponential_delay(initial: Duration, max: Duration, attempt: usize) -> Duration {
    let mut delay = initial;
    for _ in 1..attempt {
        delay = std::cmp::min(delay.saturating_mul(2), max);
    }
    delay
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
