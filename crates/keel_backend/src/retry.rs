//! Timeout and bounded retry around backend calls.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::Retryable;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{BackendError, BackendResult};

/// Result of a retried operation together with the attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Run `call` with an optional deadline; an elapsed deadline becomes
/// [`BackendError::Timeout`].
pub async fn with_timeout<T, Fut>(timeout: Option<Duration>, call: Fut) -> BackendResult<T>
where
    Fut: Future<Output = BackendResult<T>>,
{
    match timeout {
        None => call.await,
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(limit)),
        },
    }
}

/// Retry `op` with the configured backoff while `retryable` holds.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &RetryConfig,
    label: &str,
    mut op: F,
    retryable: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let attempts = AtomicU32::new(0);

    let result = (|| {
        attempts.fetch_add(1, Ordering::SeqCst);
        op()
    })
    .retry(config.backoff())
    .when(|e| retryable(e))
    .notify(|e, delay| {
        warn!(
            step = label,
            delay = ?delay,
            error = %e,
            "Backend call failed, retrying"
        );
    })
    .await;

    RetryOutcome {
        result,
        attempts: attempts.load(Ordering::SeqCst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig::default().attempts(attempts).delays(1, 5)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let outcome = retry_with_backoff(
            &fast(5),
            "bucket",
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BackendError::Unavailable("503".into()))
                } else {
                    Ok("created")
                }
            },
            BackendError::is_retryable,
        )
        .await;

        assert_eq!(outcome.result.unwrap(), "created");
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_stops_at_bound() {
        let outcome: RetryOutcome<(), BackendError> = retry_with_backoff(
            &fast(3),
            "database",
            || async { Err(BackendError::Throttled("slow down".into())) },
            BackendError::is_retryable,
        )
        .await;

        assert!(matches!(outcome.result, Err(BackendError::Throttled(_))));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let outcome: RetryOutcome<(), BackendError> = retry_with_backoff(
            &fast(3),
            "instance",
            || async { Err(BackendError::Rejected("bad image".into())) },
            BackendError::is_retryable,
        )
        .await;

        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_backend_error() {
        let result: BackendResult<()> = with_timeout(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(BackendError::Timeout(_))));
    }
}
