//! Retry with exponential backoff for transient driver failures.
//!
//! Only [`DriverError::is_transient`] errors (timeouts, lost connections) are
//! retried; anything else ends the attempt loop immediately.
//!
//! ```text
//! attempt 1: immediate
//! attempt 2: wait initial_backoff
//! attempt 3: wait initial_backoff * multiplier
//! ...        capped at max_backoff
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::error::DriverError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for RetryPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-indexed):
    /// `min(initial_backoff * multiplier^retry, max_backoff)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let backoff_ms = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        if !backoff_ms.is_finite() {
            return self.max_backoff;
        }
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }
}

/// An error together with the number of attempts spent.
#[derive(Debug, Clone)]
pub struct Exhausted {
    pub error: DriverError,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// attempts. Returns the value and the attempts used.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<(T, u32), Exhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok((value, attempt));
            }
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let backoff = policy.backoff(attempt - 1);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    kind = %error.kind,
                    error = %error.message,
                    "transient driver error, retrying"
                );
                sleep(backoff).await;
            }
            Err(error) => return Err(Exhausted { error, attempts: attempt }),
        }
    }
}
