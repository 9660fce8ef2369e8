//! Per-range retry policy: a bounded attempt counter with exponential
//! backoff, grounded in the chunk-retry loop of `engine.rs::download_loop`
//! in the teacher crate, generalized to the spec's doubling delay instead of
//! the teacher's fixed five-second sleep.

use std::time::Duration;

use tracing::warn;

/// What the caller should do after [`RetryPolicy::handle_error`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryOutcome {
    /// Budget remains; the caller already slept and should retry.
    Continue,
    /// Budget exhausted; the caller should re-raise the last error.
    GiveUp,
}

/// Stateful retry counter for a single range fetch.
///
/// A fresh instance is created per range (per §4.5): retries never share
/// state across ranges. `attempts <= max_retries` yields `max_retries + 1`
/// total attempts, matching the source's off-by-one-looking-but-intended
/// condition.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    attempts: u32,
    max_retries: u32,
    initial_delay: Duration,
}

impl RetryPolicy {
    pub(crate) fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_retries,
            initial_delay,
        }
    }

    /// Record a failed attempt. If budget remains, sleeps for
    /// `initial_delay * 2^attempt_number` (first retry waits
    /// `2*initial_delay`, doubling thereafter) and returns
    /// [`RetryOutcome::Continue`]; otherwise returns
    /// [`RetryOutcome::GiveUp`] without sleeping.
    pub(crate) async fn handle_error(&mut self) -> RetryOutcome {
        self.attempts += 1;
        if self.attempts > self.max_retries {
            return RetryOutcome::GiveUp;
        }
        let delay = self.initial_delay * 2u32.pow(self.attempts);
        warn!(attempt = self.attempts, ?delay, "retrying after error");
        tokio::time::sleep(delay).await;
        RetryOutcome::Continue
    }
}
