//! Bounded retry for async operations that may fail transiently.
//!
//! Only the CA-bundle registration at startup retries; admission handling
//! never does.
//!
//! # Example
//!
//! ```ignore
//! use agent_injector::retry::{retry_with_delay, RetryConfig};
//!
//! let result = retry_with_delay(
//!     &RetryConfig::fixed(5, Duration::from_secs(2)),
//!     "register_ca_bundle",
//!     || async { registrar.register(&bundle).await },
//! ).await;
//! ```

use std::time::Duration;

use tracing::{error, warn};

/// A bounded number of attempts separated by a constant delay
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts made before giving up; zero still runs the operation once
    pub max_attempts: u32,
    /// Pause between consecutive attempts
    pub delay: Duration,
}

impl RetryConfig {
    /// Retry up to `attempts` times, waiting `delay` after each failure
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            delay,
        }
    }
}

/// Execute an async operation, retrying on failure.
///
/// Retries until success or until `max_attempts` is exhausted, in which case
/// the last error is returned.
pub async fn retry_with_delay<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = config.delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(config.delay).await;
            }
        }
    }
}
