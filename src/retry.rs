//! Retry utilities with exponential backoff and jitter for persistence calls.
//!
//! Cryptographic work is never wrapped here; only outbound store calls get a
//! timeout and are retried.
//!
//! # Example
//!
//! ```ignore
//! use serving_cert_signer::retry::{retry_transient, RetryConfig};
//!
//! let secret = retry_transient(&RetryConfig::default(), "get_secret", || {
//!     store.get_secret("service-ca", "signing-key")
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::config::ControllerSettings;
use crate::errors::{Error, Result};

/// Backoff settings for store calls.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound on a single store call
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn from_settings(settings: &ControllerSettings) -> Self {
        Self {
            initial_delay: settings.initial_backoff(),
            max_delay: settings.max_backoff(),
            call_timeout: settings.persistence_timeout(),
            ..Default::default()
        }
    }

    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Un-jittered delay before retry number `attempt` (1-based), capped at
    /// `max_delay`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// `backoff_for_attempt` scaled by a random factor in 0.5..1.5.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(self.backoff_for_attempt(attempt).as_secs_f64() * jitter)
    }
}

/// Bound a store call by `timeout`. Elapsed calls become `Persistence` errors.
pub async fn with_timeout<F, T>(timeout: Duration, operation_name: &str, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(Error::persistence(format!(
            "{} timed out after {}ms",
            operation_name,
            timeout.as_millis()
        ))),
    }
}

/// Run a store call with a per-attempt timeout, retrying transient failures
/// with exponential backoff and jitter.
///
/// Non-transient errors (conflicts, not-found, crypto errors) return
/// immediately.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match with_timeout(config.call_timeout, operation_name, operation()).await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Store call failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.jittered_backoff(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Store call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
