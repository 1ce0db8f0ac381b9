//! Bounded exponential backoff for transient store failures
//!
//! Validation, state and conflict errors are returned on the first attempt;
//! only `Error::is_transient()` failures are retried.

use std::future::Future;

use crate::Result;
use crate::config::RetryConfig;

/// Run `operation`, retrying transient failures up to `policy.retries` times
/// with delays of `base`, `2 * base`, `4 * base`, ...
pub async fn with_retry<T, F, Fut>(policy: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = policy.base_delay();

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_transient() || attempt > policy.retries {
                    return Err(err);
                }
                tracing::debug!(attempt, ?delay, "retrying transient store error: {err}");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(retries: u32) -> RetryConfig {
        RetryConfig {
            retries,
            base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::transient("timeout"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: crate::Result<()> = with_retry(&fast_policy(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient("timeout"))
        })
        .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: crate::Result<()> = with_retry(&fast_policy(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::conflict("already submitted"))
        })
        .await;

        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
