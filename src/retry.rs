//! Bounded repeat-until-success loop used by every multi-step protocol action.

use std::time::Duration;

use log::debug;

use crate::errors::AttemptError;

/// Fixed pause between repeats of a protocol step.
pub const OP_RETRY_DELAY: Duration = Duration::from_millis(3);
/// Hard ceiling on iterations; hitting it is a programming error.
pub const RETRY_LIMIT: u32 = 100_000;

const INITIAL_BACKOFF_MS: u64 = 1;
const MAX_BACKOFF_MS: u64 = 100;

/// What a protocol step asks the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatAction {
    NoRepeat,
    RepeatWithDelay,
    RepeatNoDelay,
    RepeatWithBackoff,
}

/// Iteration state for one protocol step.
///
/// ```ignore
/// let mut retry = RetryLoop::new("set_atr_commit");
/// loop {
///     retry.next_iteration()?;
///     match step().await {
///         Ok(()) => break,
///         Err(_) => retry.pause(RepeatAction::RepeatWithDelay).await,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct RetryLoop {
    caller: &'static str,
    limit: u32,
    iterations: u32,
    backoff_ms: u64,
}

impl RetryLoop {
    pub fn new(caller: &'static str) -> Self {
        Self::with_limit(caller, RETRY_LIMIT)
    }

    pub fn with_limit(caller: &'static str, limit: u32) -> Self {
        Self {
            caller,
            limit,
            iterations: 0,
            backoff_ms: INITIAL_BACKOFF_MS,
        }
    }

    /// Counts one iteration, failing once the ceiling is exceeded.
    pub fn next_iteration(&mut self) -> Result<(), AttemptError> {
        if self.iterations > self.limit {
            return Err(AttemptError::RetryLimitExceeded {
                limit: self.limit,
                caller: self.caller,
            });
        }
        self.iterations += 1;
        Ok(())
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Sleeps according to `action`. Backoff grows tenfold per call, capped at 100ms.
    pub async fn pause(&mut self, action: RepeatAction) {
        match action {
            RepeatAction::RepeatWithDelay => tokio::time::sleep(OP_RETRY_DELAY).await,
            RepeatAction::RepeatWithBackoff => {
                debug!("{} backing off {}ms", self.caller, self.backoff_ms);
                tokio::time::sleep(Duration::from_millis(self.backoff_ms)).await;
                self.backoff_ms = (self.backoff_ms * 10).min(MAX_BACKOFF_MS);
            }
            RepeatAction::RepeatNoDelay | RepeatAction::NoRepeat => {}
        }
    }

    pub(crate) fn current_backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}
