//! Fail-open and bounded-retry helpers
//!
//! Infrastructure operations (record writes, registry upkeep) go through
//! [`fail_open`] so a failure is logged and swallowed. Transient control-link
//! failures go through [`retry_fixed`], which retries only errors the caller
//! classifies as retryable.
//!
//! DO NOT use fail-open for:
//! - Vote tallying
//! - Circuit eligibility decisions
//! - Configuration loading

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// ```no_run
/// use tova_core::fail_open::fail_open;
/// use tova_core::Result;
///
/// async fn write_record() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("record_sink", || write_record()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Retry an operation with a fixed pause between attempts
///
/// Only errors for which `retryable` returns true are retried; any other
/// error is returned immediately. After `max_attempts` retryable failures
/// the last error is returned.
pub async fn retry_fixed<F, Fut, T, E, R>(
    operation_name: &str,
    max_attempts: usize,
    delay: Duration,
    retryable: R,
    mut f: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if retryable(&e) && attempt < max_attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_attempts, e
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ControlError, TovaError};

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, TovaError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(TovaError::Other("test error".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_retry_fixed_recovers() {
        let mut attempts = 0;
        let result = retry_fixed(
            "consensus",
            3,
            Duration::from_millis(1),
            ControlError::is_retryable,
            || {
                attempts += 1;
                let current = attempts;
                async move {
                    if current < 3 {
                        Err(ControlError::DescriptorUnavailable("ns/all".into()))
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_fixed_exhausts() {
        let mut attempts = 0;
        let result: std::result::Result<(), _> = retry_fixed(
            "consensus",
            3,
            Duration::from_millis(1),
            ControlError::is_retryable,
            || {
                attempts += 1;
                async { Err(ControlError::DescriptorUnavailable("ns/all".into())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_fixed_stops_on_rejection() {
        let mut attempts = 0;
        let result: std::result::Result<(), _> = retry_fixed(
            "close",
            3,
            Duration::from_millis(1),
            ControlError::is_retryable,
            || {
                attempts += 1;
                async { Err(ControlError::InvalidArguments("unknown".into())) }
            },
        )
        .await;
        assert_eq!(
            result,
            Err(ControlError::InvalidArguments("unknown".into()))
        );
        assert_eq!(attempts, 1);
    }
}
