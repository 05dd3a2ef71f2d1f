//! Retry logic and backoff strategies

use crate::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy trait
pub trait RetryPolicy: Send + Sync {
    /// Whether another attempt is allowed after `attempt` attempts have failed
    fn should_retry(&self, attempt: u32) -> bool;

    /// Delay before retry number `retry` (0-based)
    fn delay(&self, retry: u32) -> Duration;

    fn max_attempts(&self) -> u32;
}

/// Exponential backoff retry policy
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    fn delay(&self, retry: u32) -> Duration {
        let base_delay = Duration::from_millis(self.config.base_delay_ms);
        let exponential_delay = base_delay.mul_f64(self.config.multiplier.powi(retry as i32));

        let delay_ms = exponential_delay
            .as_millis()
            .min(self.config.max_delay_ms as u128) as u64;

        let jitter = if self.config.jitter_ms > 0 {
            fastrand::u64(0..=self.config.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(delay_ms + jitter)
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }
}

/// Every attempt failed
#[derive(Debug, thiserror::Error)]
#[error("Operation failed after {attempts} attempts: {last_error}")]
pub struct RetryExhausted<E: std::error::Error + 'static> {
    pub attempts: u32,
    #[source]
    pub last_error: E,
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor<P: RetryPolicy> {
    policy: P,
}

impl<P: RetryPolicy> RetryExecutor<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Execute an operation with retry logic.
    ///
    /// The closure receives the 1-based attempt number. On success the number of
    /// attempts used is returned alongside the value.
    pub async fn execute<F, Fut, T, E>(
        &self,
        mut operation: F,
    ) -> Result<(T, u32), RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok((result, attempt));
                }
                Err(error) => {
                    if !self.policy.should_retry(attempt) {
                        return Err(RetryExhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    let delay = self.policy.delay(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Operation failed, retrying"
                    );

                    sleep(delay).await;
                }
            }
        }
    }
}

/// Convenience function to create an exponential backoff executor
pub fn exponential_backoff(config: RetryConfig) -> RetryExecutor<ExponentialBackoff> {
    RetryExecutor::new(ExponentialBackoff::new(config))
}
