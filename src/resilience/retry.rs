//! Retry driver for fallible async operations.

use std::future::Future;

use thiserror::Error;

use crate::resilience::backoff::BackoffStrategy;

/// How an attempt failed.
#[derive(Debug)]
pub enum OpError<E> {
    /// Stop retrying without treating it as a failure. Ops return this when
    /// their cancellation scope fires mid-attempt.
    EndOfRetry,
    /// Transient failure; ask the strategy for the next delay.
    Retry(E),
}

/// Terminal outcome of a retry loop that never succeeded.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("end of retry")]
    EndOfRetry,

    #[error("retries exhausted: {0}")]
    Exhausted(E),
}

/// Drive `op` until it succeeds, signals end-of-retry, or the strategy stops.
///
/// Between failed attempts the driver sleeps for the strategy's delay. The
/// sleep is cancelled by dropping the returned future; callers that must not
/// outlive a shutdown race this against their cancellation signal.
pub async fn retry<T, E, F, Fut, S>(mut op: F, mut strategy: S) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OpError<E>>>,
    S: BackoffStrategy,
{
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(OpError::EndOfRetry) => return Err(RetryError::EndOfRetry),
            Err(OpError::Retry(e)) => match strategy.backoff() {
                Some(delay) => {
                    tracing::debug!(after_ms = delay.as_millis() as u64, "backoff");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(RetryError::Exhausted(e)),
            },
        }
    }
}
