//! Retry logic with exponential backoff.
//!
//! Only [`SyncError::Transient`] failures are retried; everything else is
//! returned to the caller on the first attempt.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{Result, SyncError};

/// Backoff settings for transient remote failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, the first one included
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no backoff.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        self.initial_delay
            .mul_f64(self.factor.powi(exponent))
            .min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds, fails non-transiently, or runs out of
/// attempts.
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("Operation '{}' succeeded after {} attempts", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(err @ SyncError::Transient(_)) if attempt < max_attempts => {
                let delay = config.delay_for(attempt);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempt, max_attempts, err, delay
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
