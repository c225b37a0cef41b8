//! Bounded retry with exponential backoff and jitter.
//!
//! The delay after failed attempt `n` (0-indexed) is
//! `min(initial_delay * multiplier^n, max_delay)` plus a uniform jitter of up
//! to 30% of that value. Only failures classified by
//! [`crate::Error::is_retryable`] consume retries; anything else is returned
//! on first occurrence.

use crate::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub initial_delay_ms: u64,
    /// Cap on the base delay.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Loads the retry policy from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `STOWAGE_RETRY_MAX_RETRIES` | 3 |
    /// | `STOWAGE_RETRY_INITIAL_DELAY_MS` | 1000 |
    /// | `STOWAGE_RETRY_MAX_DELAY_MS` | 10000 |
    /// | `STOWAGE_RETRY_BACKOFF_MULTIPLIER` | 2.0 |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("STOWAGE_RETRY_MAX_RETRIES")
            && let Ok(parsed) = v.parse::<u32>()
        {
            self.max_retries = parsed;
        }
        if let Ok(v) = std::env::var("STOWAGE_RETRY_INITIAL_DELAY_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.initial_delay_ms = parsed;
        }
        if let Ok(v) = std::env::var("STOWAGE_RETRY_MAX_DELAY_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.max_delay_ms = parsed;
        }
        if let Ok(v) = std::env::var("STOWAGE_RETRY_BACKOFF_MULTIPLIER")
            && let Ok(parsed) = v.parse::<f64>()
            && parsed.is_finite()
        {
            self.backoff_multiplier = parsed.max(1.0);
        }
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial delay in milliseconds.
    #[must_use]
    pub const fn with_initial_delay_ms(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }

    /// Sets the delay cap in milliseconds.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay_ms: u64) -> Self {
        self.max_delay_ms = delay_ms;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Base delay (without jitter) after failed attempt `attempt`, in milliseconds.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay_ms as f64 * multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        if capped.is_finite() {
            capped.max(0.0) as u64
        } else {
            self.max_delay_ms
        }
    }

    /// Full delay after failed attempt `attempt`: base plus up to 30% jitter.
    pub fn delay_for_attempt<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_ms(attempt);
        let max_jitter = base.saturating_mul(3) / 10;
        let jitter = rng.random_range(0..=max_jitter);
        Duration::from_millis(base.saturating_add(jitter))
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl RetryExecutor {
    /// Creates an executor with OS-seeded jitter.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Creates an executor with deterministic jitter.
    #[must_use]
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self {
            policy,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Returns the policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Draws the delay that follows failed attempt `attempt`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        self.policy.delay_for_attempt(attempt, &mut *rng)
    }

    /// Runs `operation` up to `max_retries + 1` times.
    ///
    /// Non-retryable errors are returned immediately. When every attempt
    /// fails, the last error is returned.
    pub async fn retry_with_backoff<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.policy.max_retries;
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            operation = label,
                            retries = attempt,
                            "Operation succeeded after retry"
                        );
                        metrics::counter!(
                            "storage_retry_recoveries_total",
                            "operation" => label.to_string()
                        )
                        .increment(1);
                    }
                    return Ok(value);
                },
                Err(err) if !err.is_retryable() => {
                    tracing::debug!(
                        operation = label,
                        attempt = attempt + 1,
                        error = %err,
                        "Non-retryable failure"
                    );
                    return Err(err);
                },
                Err(err) if attempt >= max_retries => {
                    tracing::warn!(
                        operation = label,
                        attempts = attempt + 1,
                        error = %err,
                        "Retries exhausted"
                    );
                    return Err(err);
                },
                Err(err) => {
                    let delay = self.next_delay(attempt);
                    tracing::warn!(
                        operation = label,
                        attempt = attempt + 1,
                        max_attempts = max_retries + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Retrying after transient failure"
                    );
                    metrics::counter!(
                        "storage_retries_total",
                        "operation" => label.to_string()
                    )
                    .increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}
