//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// A retry-delay strategy. Returns the delay before the next attempt, or
/// `None` to stop retrying.
pub trait BackoffStrategy: Send {
    fn backoff(&mut self) -> Option<Duration>;
}

/// Exponential backoff: `min_interval × 2^attempt`, capped at
/// `max_interval`, stopping after `max_retry` attempts.
#[derive(Debug)]
pub struct ExpBackoff {
    min_interval: Duration,
    max_interval: Duration,
    max_retry: u32,
    attempt: u32,
}

impl ExpBackoff {
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval,
            max_retry: u32::MAX,
            attempt: 0,
        }
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }
}

impl BackoffStrategy for ExpBackoff {
    fn backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retry {
            return None;
        }

        let factor = 1u32 << self.attempt.min(31);
        self.attempt += 1;

        let delay = self.min_interval.saturating_mul(factor);
        Some(delay.min(self.max_interval))
    }
}

/// Adds a uniformly random delay in `[0, jitter)` to every non-stop backoff,
/// spreading out reconnect storms.
#[derive(Debug)]
pub struct Jittered<S> {
    inner: S,
    jitter: Duration,
}

impl<S: BackoffStrategy> Jittered<S> {
    pub fn new(inner: S, jitter: Duration) -> Self {
        Self { inner, jitter }
    }
}

impl<S: BackoffStrategy> BackoffStrategy for Jittered<S> {
    fn backoff(&mut self) -> Option<Duration> {
        let delay = self.inner.backoff()?;
        if self.jitter.is_zero() {
            return Some(delay);
        }

        let extra = rand::thread_rng().gen_range(0..self.jitter.as_nanos() as u64);
        Some(delay + Duration::from_nanos(extra))
    }
}
