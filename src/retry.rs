use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use serde::Deserialize;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `min(base * 2^retry, max) + jitter(0..base)`
    #[default]
    Exponential,
    /// Always `base`, no jitter.
    Fixed,
}

/// Bounded retry policy for probes and range retrievals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(120),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryConfig {
    /// A policy that never waits, for tests and one-shot probes.
    #[cfg(test)]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: Backoff::Fixed,
        }
    }

    /// Compute the delay for a given retry attempt (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
                let exp_delay = self.base_delay.saturating_mul(factor);
                let capped = exp_delay.min(self.max_delay);
                let base_ms = self.base_delay.as_millis() as u64;
                let jitter = if base_ms > 0 {
                    rand::thread_rng().gen_range(0..base_ms)
                } else {
                    0
                };
                capped + Duration::from_millis(jitter)
            }
        }
    }
}

/// Retry an async operation with the configured backoff.
///
/// - `config`: retry configuration
/// - `classifier`: inspects an error and returns `Retry` or `Abort`
/// - `operation`: the async closure to retry
///
/// Returns the first `Ok` result, or the last error if retries are exhausted
/// or the classifier returns `Abort`.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                attempt += 1;
                if classifier(&e) == RetryAction::Abort || attempt >= total_attempts {
                    return Err(e);
                }
                let delay = config.delay_for_retry(attempt - 1);
                tracing::warn!(
                    attempt,
                    total_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retryable error, backing off: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Serde helper: durations are written as whole seconds in dataset files.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("delay must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
