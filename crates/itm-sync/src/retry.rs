use std::future::Future;
use std::time::Duration;

use itm_adapters::CollectError;
use tracing::warn;

use crate::clock::Clock;
use crate::config::RetryConfig;

/// Terminal result of a retried upstream call.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    /// Short-circuits the policy: never retried in place.
    RateLimited {
        retry_after: Option<Duration>,
        attempts: u32,
    },
    /// Permanent failure, or transient failures until attempts ran out.
    Failed { error: CollectError, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Success { attempts, .. }
            | RetryOutcome::RateLimited { attempts, .. }
            | RetryOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Bounded exponential backoff with a fixed, jitter-free schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(RetryConfig::default())
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Drive `op` until it succeeds, is rate limited, fails permanently or
    /// runs out of attempts. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, clock: &dyn Clock, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CollectError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    }
                }
                Err(CollectError::RateLimited { retry_after }) => {
                    return RetryOutcome::RateLimited {
                        retry_after,
                        attempts: attempt,
                    }
                }
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt - 1);
                    warn!(attempt, delay_secs = delay.as_secs(), %error, "retrying upstream call");
                    clock.sleep(delay).await;
                }
                Err(error) => {
                    return RetryOutcome::Failed {
                        error,
                        attempts: attempt,
                    }
                }
            }
        }
    }
}
