//! Retry of blocking model calls on transient server errors.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::AnalysisError;

/// Returns `true` for errors worth another attempt: 500, 502, 503 and 504.
pub fn is_retryable(err: &AnalysisError) -> bool {
    matches!(err, AnalysisError::Server(e) if e.is_retryable())
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or
/// `policy.max_retries` retries are spent.
///
/// The closure receives the 0-based attempt number. Backoff sleeps end early
/// with `Cancelled` when `cancel` fires.
///
/// # Errors
/// The last error returned by `attempt`, or `Cancelled`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryConfig,
    operation: &str,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<T, AnalysisError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AnalysisError>>,
{
    let mut retries = 0;
    loop {
        match attempt(retries).await {
            Ok(value) => return Ok(value),
            Err(err) if retries < policy.max_retries && is_retryable(&err) => {
                let delay = policy.delay_for(retries);
                retries += 1;
                warn!(
                    operation,
                    retry = retries,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Retrying after transient server error"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(AnalysisError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsage_abstraction::{ErrorKind, ServerError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryConfig {
        RetryConfig { max_retries: 3, base_delay_ms: 1000, max_delay_ms: 30_000 }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let value = with_retry(&policy(), "test", &CancellationToken::new(), |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Err(AnalysisError::Server(ServerError::from_status(502, "bad gateway"))),
                    1 => Err(AnalysisError::Server(ServerError::from_status(503, "busy"))),
                    _ => Ok("done"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff.
        assert!(started.elapsed() >= std::time::Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&policy(), "test", &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AnalysisError::Server(ServerError::from_status(500, "boom"))) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AnalysisError::Server(e) if e.status == Some(500)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&policy(), "test", &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(AnalysisError::Server(ServerError::new(ErrorKind::Connect, "refused"))) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AnalysisError::Server(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let err = with_retry(&policy(), "test", &cancel, |_| {
            trigger.cancel();
            async { Err::<(), _>(AnalysisError::Server(ServerError::from_status(503, "busy"))) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, AnalysisError::Cancelled));
    }
}
