//! Retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;

use mcp_protocol::ProtocolError;
use tracing::warn;

use crate::config::RetryConfig;

/// Default retry predicate: network, timeout, and server errors.
pub fn is_retryable(err: &ProtocolError) -> bool {
    err.is_retryable()
}

/// Run `operation` until it succeeds, fails terminally, or retries run out.
///
/// The attempt counter starts at 0. A failure is returned as-is when
/// `attempt == max_retries` or `retryable` rejects it; otherwise the engine
/// sleeps `min(initial × factor^attempt, max)` and tries again.
pub async fn with_retry<T, E, F, Fut, P>(
    mut operation: F,
    config: &RetryConfig,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= config.max_retries || !retryable(&err) => return Err(err),
            Err(err) => {
                let delay = config.delay_for(attempt);
                attempt += 1;
                warn!(
                    "Attempt {attempt}/{} failed, retrying in {}ms: {err}",
                    config.max_retries + 1,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use mcp_protocol::ErrorCode;
    use tokio::time::Instant;

    use super::*;

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 100,
            backoff_factor: 2.0,
            max_delay_ms: 1000,
        }
    }

    /// An operation that fails with `code` for the first `failures` calls.
    fn flaky(
        failures: u32,
        code: ErrorCode,
    ) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u32, ProtocolError>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(ProtocolError::new(code, format!("failure {n}")))
            } else {
                Ok(n)
            })
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_100_200_400() {
        let (calls, op) = flaky(3, ErrorCode::NetworkError);
        let start = Instant::now();

        let result = with_retry(op, &config(3), is_retryable).await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(750), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error() {
        let (calls, op) = flaky(10, ErrorCode::TimeoutError);

        let err = with_retry(op, &config(2), is_retryable).await.unwrap_err();

        assert_eq!(err.code, ErrorCode::TimeoutError);
        assert_eq!(err.message, "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_errors_are_not_retried() {
        for code in [
            ErrorCode::ValidationError,
            ErrorCode::AuthenticationError,
            ErrorCode::ResourceNotFound,
            ErrorCode::RateLimitExceeded,
            ErrorCode::NotConnected,
        ] {
            let (calls, op) = flaky(1, code);
            let start = Instant::now();

            let err = with_retry(op, &config(3), is_retryable).await.unwrap_err();

            assert_eq!(err.code, code);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(start.elapsed(), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_makes_one_attempt() {
        let (calls, op) = flaky(1, ErrorCode::ServerError);
        assert!(with_retry(op, &config(0), is_retryable).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_capped() {
        let (_, op) = flaky(3, ErrorCode::ServerError);
        let capped = RetryConfig {
            max_retries: 3,
            initial_delay_ms: 100,
            backoff_factor: 10.0,
            max_delay_ms: 300,
        };
        let start = Instant::now();

        with_retry(op, &capped, is_retryable).await.unwrap();

        // 100 + 300 + 300
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700) && elapsed < Duration::from_millis(750));
    }
}
