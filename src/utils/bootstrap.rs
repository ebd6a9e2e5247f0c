//! Bootstrap utilities for hmq-events binaries.
//!
//! Shared initialization code for the operator binaries.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with HMQ_EVENTS_LOG environment variable.
///
/// Defaults to "info" level if HMQ_EVENTS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Connect to the broker with exponential backoff and jitter.
///
/// # Arguments
/// * `address` - The broker address, for logging
/// * `max_retries` - Retries after the first attempt
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error after max retries.
pub async fn connect_with_retry<T, E, F, Fut>(
    address: &str,
    max_retries: usize,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(max_retries)
        .with_jitter();

    let result = connect
        .retry(backoff)
        .notify(|e: &E, delay: Duration| {
            warn!(
                address = %address,
                error = %e,
                backoff_ms = %delay.as_millis(),
                "Failed to connect to broker, retrying after backoff"
            );
        })
        .await;

    match &result {
        Ok(_) => info!(address = %address, "Connected to broker"),
        Err(e) => tracing::error!(address = %address, error = %e, "Giving up connecting to broker"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_connect_with_retry_eventually_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<u8, String> = connect_with_retry("test", 5, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("refused".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), String> = connect_with_retry("test", 2, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("refused".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
