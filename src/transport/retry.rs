// ============================================================================
// File: src/transport/retry.rs
// ----------------------------------------------------------------------------
// Bounded retry with exponential backoff for connection establishment.
// ============================================================================

use std::future::Future;
use std::time::Duration;

use log::{error, warn};

use crate::error::CloneResult;

/// Attempt budget and first backoff delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Run `operation` until it succeeds, fails permanently, or the budget runs out
///
/// Only errors for which [`crate::CloneError::is_retryable`] holds are
/// retried; authentication and host-key failures surface on the first
/// attempt.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    host: &str,
    mut operation: F,
) -> CloneResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = CloneResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                error!(
                    "Giving up on host={host} after {attempt} attempts: {e}"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Attempt {attempt}/{} failed for host={host}: {e}; retrying in {:?}",
                    policy.max_attempts, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
