/*!
 * Utility functions and helpers for Starflow.
 *
 * Bounded waits and retries shared by the device clients and the engine.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::Error;

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or [`Error::Timeout`] converted into the
/// caller's error type when the timeout is reached
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!("no result within {:?}", duration)).into()),
    }
}

/// Retry a fallible operation
///
/// # Arguments
///
/// * `retries` - The number of retries after the first attempt
/// * `delay` - Pause between attempts
/// * `future_factory` - A function that creates a new future for each attempt
///
/// # Returns
///
/// The first success, or the last error if all attempts fail
pub async fn with_retry<F, Fut, T, E>(retries: usize, delay: Duration, future_factory: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(retries, delay, future_factory, |_| true).await
}

/// Retry a fallible operation while `should_retry` accepts the error
///
/// An error rejected by `should_retry` is returned immediately.
pub async fn with_retry_if<F, Fut, T, E, P>(
    retries: usize,
    delay: Duration,
    mut future_factory: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match future_factory().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt < retries && should_retry(&e) => {
                attempt += 1;
                warn!("Attempt {} failed: {}, retrying", attempt, e);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}
