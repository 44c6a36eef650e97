//! Immediate retry budget for transient provider failures.

use std::future::Future;
use std::time::Duration;

use rand::{Rng, thread_rng};

use crate::adapters::ProviderError;
use crate::config::RetryPolicyConfig;

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_factor: config.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempts_completed` failures:
    /// `min(base * 2^n, max) * (1 ± jitter)`.
    pub fn backoff(&self, attempts_completed: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = (base_ms * 2_f64.powi(attempts_completed.min(30) as i32)).min(max_ms);

        let jitter = if self.jitter_factor > 0.0 && exp > 0.0 {
            thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor) * exp
        } else {
            0.0
        };

        Duration::from_millis((exp + jitter).max(0.0) as u64)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. Returns the last error alongside the number of
    /// attempts made.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, (ProviderError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt - 1);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient provider error; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }
}
