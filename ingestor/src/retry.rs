use crate::errors::{Error, Result};
use crate::metrics::{COMMIT_FAILURES_TOTAL, COMMIT_RETRIES_TOTAL};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bounded retry with exponential backoff for whole transaction attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_interval: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_interval,
        }
    }

    /// Wait before attempt `attempt + 1`: `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_interval.saturating_mul(factor)
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// runs out of attempts, or `cancel` fires.
    ///
    /// The operation receives the 1-based attempt number. A cancelled attempt
    /// is dropped mid-flight, which aborts whatever transaction it holds.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = operation(attempt) => outcome,
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!("Transaction committed after {} attempts", attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    if attempt >= self.max_attempts {
                        error!("Transaction failed after {} attempts: {}", attempt, e);
                        COMMIT_FAILURES_TOTAL.inc();
                        return Err(Error::CommitFailure {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }

                    let wait = self.backoff(attempt);
                    warn!(
                        "Transaction attempt {}/{} timed out, retrying in {}ms: {}",
                        attempt,
                        self.max_attempts,
                        wait.as_millis(),
                        e
                    );
                    COMMIT_RETRIES_TOTAL.inc();

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
