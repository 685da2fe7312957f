//! Retry policy with configurable backoff.
//!
//! One policy implementation serves all three retry layers: adapters use it
//! for HTTP attempts, the fallback handler for generation attempts. An error
//! that carries an explicit wait hint (a rate-limit `retry-after`) overrides
//! the computed backoff for that attempt.

use forge_core::{ForgeError, ForgeResult, RetryLayer, RetryTracker};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff growth strategy.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `base * multiplier^attempt`, capped at the maximum delay.
    Exponential {
        /// Growth factor per attempt.
        multiplier: f64,
    },
    /// `base + increment * attempt`, capped at the maximum delay.
    Linear {
        /// Added delay per attempt.
        increment: Duration,
    },
}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries (attempts = retries + 1).
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for any computed delay.
    pub max_delay: Duration,
    /// Backoff growth strategy.
    pub backoff: Backoff,
    /// Jitter factor (0.0 - 1.0) applied to computed delays.
    pub jitter: f64,
    /// HTTP status codes retried even when the error is not marked retryable.
    pub retry_on_status: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential { multiplier: 2.0 },
            jitter: 0.25,
            retry_on_status: vec![429, 500, 502, 503, 504],
        }
    }
}

/// Retry policy implementation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Create a policy with custom max retries.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(RetryConfig {
            max_retries,
            ..Default::default()
        })
    }

    /// Create a linear-backoff policy (used for 5xx-style transient errors).
    #[must_use]
    pub fn linear(max_retries: u32, increment: Duration) -> Self {
        Self::new(RetryConfig {
            max_retries,
            backoff: Backoff::Linear { increment },
            ..Default::default()
        })
    }

    /// Calculate delay for a given attempt (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as f64;
        let raw = match self.config.backoff {
            Backoff::Exponential { multiplier } => base * multiplier.powi(attempt as i32),
            Backoff::Linear { increment } => {
                base + increment.as_millis() as f64 * f64::from(attempt)
            }
        };
        let delay = raw.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = delay * self.config.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Check if an error is retryable under this policy.
    #[must_use]
    pub fn is_retryable(&self, error: &ForgeError) -> bool {
        if error.is_retryable() {
            return true;
        }
        if let ForgeError::Provider {
            status_code: Some(code),
            ..
        } = error
        {
            return self.config.retry_on_status.contains(code);
        }
        false
    }

    /// Execute an operation with retry logic.
    ///
    /// The operation receives the 0-indexed attempt number.
    ///
    /// # Errors
    /// Returns the last error once the budget is exhausted or the error is
    /// not retryable.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> ForgeResult<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = ForgeResult<T>>,
    {
        self.execute_tracked(RetryLayer::Http, &RetryTracker::new(), operation)
            .await
    }

    /// Execute an operation, recording every attempt into `tracker` at `layer`.
    ///
    /// An error carrying an explicit [`ForgeError::retry_after`] hint
    /// overrides the computed backoff for the following attempt.
    ///
    /// # Errors
    /// Returns the last error once the budget is exhausted or the error is
    /// not retryable.
    pub async fn execute_tracked<F, Fut, T>(
        &self,
        layer: RetryLayer,
        tracker: &RetryTracker,
        operation: F,
    ) -> ForgeResult<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = ForgeResult<T>>,
    {
        let mut wait: Option<Duration> = None;
        let mut reason = String::from("initial attempt");

        for attempt in 0..=self.config.max_retries {
            if let Some(delay) = wait {
                tokio::time::sleep(delay).await;
            }
            let id = tracker.begin(layer, reason.clone(), wait);

            match operation(attempt).await {
                Ok(result) => {
                    tracker.finish(id, true);
                    if attempt > 0 {
                        debug!(layer = %layer, attempt = attempt, "retry succeeded");
                    }
                    return Ok(result);
                }
                Err(error) => {
                    tracker.finish(id, false);
                    if !self.is_retryable(&error) || attempt == self.config.max_retries {
                        return Err(error);
                    }

                    let delay = error
                        .retry_after()
                        .unwrap_or_else(|| self.delay_for_attempt(attempt));
                    warn!(
                        layer = %layer,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying after error"
                    );
                    reason = error.to_string();
                    wait = Some(delay);
                }
            }
        }

        Err(ForgeError::internal("retry loop exhausted without error"))
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Builder for retry policy.
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max retries.
    #[must_use]
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    /// Set base delay.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set max delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set the backoff strategy.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Set jitter factor.
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set status codes to retry on.
    #[must_use]
    pub fn retry_on_status(mut self, codes: Vec<u16>) -> Self {
        self.config.retry_on_status = codes;
        self
    }

    /// Build the policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }
}
