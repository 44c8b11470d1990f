//! Bounded-attempt, per-attempt-timeout retry wrapper (spec.md §4.A).
//!
//! Generalizes the teacher's `with_optimistic_tx!`/`with_serializable_tx!`
//! macros in `lmsr_api.rs` (attempt loop + retryable-error gate + backoff)
//! and `original_source/internal/retryer/retryer.go`'s
//! `RetryCallWithTimeout` (per-attempt derived deadline, default intervals
//! `[1, 3, 5]` seconds) into one reusable function used by both the
//! database and the outbound accrual client.

use std::future::Future;
use std::time::Duration;

/// Default retry intervals, seconds, per spec.md §4.A.
pub const DEFAULT_INTERVALS: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(5)];

/// A predicate over `E` deciding whether a failure is worth retrying.
/// `retry_any` is the Rust equivalent of passing a `nil`/empty set in the
/// original Go signature ("retry on any error").
pub type RetryPredicate<'a, E> = &'a (dyn Fn(&E) -> bool + Send + Sync);

pub fn retry_any<E>(_err: &E) -> bool {
    true
}

/// Runs `op` up to `intervals.len()` times. Each attempt gets its own
/// `tokio::time::timeout` derived from that attempt's interval — the Rust
/// analogue of the Go version's per-attempt child context, released on
/// every exit path because `timeout` always drops the inner future.
///
/// Returns the last error (or a synthesized timeout error) if every
/// attempt is exhausted or a non-retryable error is hit early.
pub async fn retry_with_timeout<T, E, F, Fut>(
    intervals: &[Duration],
    retryable: RetryPredicate<'_, E>,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let intervals = if intervals.is_empty() { &DEFAULT_INTERVALS[..] } else { intervals };

    let mut last_err = None;
    for (attempt, interval) in intervals.iter().enumerate() {
        match tokio::time::timeout(*interval, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                let should_retry = retryable(&err);
                tracing::info!(attempt = attempt + 1, retryable = should_retry, "retry attempt failed");
                last_err = Some(RetryError::Failed(err));
                if !should_retry {
                    break;
                }
            }
            Err(_elapsed) => {
                tracing::info!(attempt = attempt + 1, interval = ?interval, "retry attempt timed out");
                last_err = Some(RetryError::Timeout);
            }
        }
    }

    Err(last_err.unwrap_or(RetryError::Timeout))
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("operation failed: {0}")]
    Failed(E),
    #[error("operation timed out")]
    Timeout,
}

/// PostgreSQL SQLSTATE classes spec.md §4.A names as retryable.
pub mod pg_error_codes {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CONNECTION_EXCEPTION: &str = "08000";
    pub const CONNECTION_DOES_NOT_EXIST: &str = "08003";
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const SQLCLIENT_UNABLE_TO_ESTABLISH: &str = "08001";
    pub const SQLSERVER_REJECTED_ESTABLISHMENT: &str = "08004";
    pub const TRANSACTION_RESOLUTION_UNKNOWN: &str = "08007";
    pub const PROTOCOL_VIOLATION: &str = "08P01";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";

    pub const RETRYABLE: &[&str] = &[
        UNIQUE_VIOLATION,
        CONNECTION_EXCEPTION,
        CONNECTION_DOES_NOT_EXIST,
        CONNECTION_FAILURE,
        SQLCLIENT_UNABLE_TO_ESTABLISH,
        SQLSERVER_REJECTED_ESTABLISHMENT,
        TRANSACTION_RESOLUTION_UNKNOWN,
        PROTOCOL_VIOLATION,
        SERIALIZATION_FAILURE,
        DEADLOCK_DETECTED,
    ];
}

/// Grounded on the teacher's `is_retryable_error` in `src/lmsr_api.rs`,
/// which walks the `std::error::Error` source chain looking for a
/// `sqlx::Error::Database` with a SQLSTATE in the retryable set.
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return pg_error_codes::RETRYABLE.contains(&code.as_ref());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_intervals() -> Vec<Duration> {
        vec![Duration::from_millis(5), Duration::from_millis(5), Duration::from_millis(5)]
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_further_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32, RetryError<&str>> = retry_with_timeout(
            &fast_intervals(),
            &retry_any,
            || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_up_to_interval_count_then_gives_up() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32, RetryError<&str>> = retry_with_timeout(
            &fast_intervals(),
            &retry_any,
            || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("boom")
                }
            },
        )
        .await;

        assert!(result.is_err());
        // Property 6: at most len(intervals) attempts, exactly len(intervals)
        // when every attempt is retryable and fails.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_immediately_on_non_retryable_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let never_retry = |_err: &&str| false;

        let result: Result<u32, RetryError<&str>> = retry_with_timeout(
            &fast_intervals(),
            &never_retry,
            || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn each_attempt_is_bounded_by_its_own_interval() {
        let intervals = vec![Duration::from_millis(20)];
        let started = std::time::Instant::now();

        let result: Result<u32, RetryError<&str>> = retry_with_timeout(&intervals, &retry_any, || async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(1)
        })
        .await;

        assert!(matches!(result, Err(RetryError::Timeout)));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn recognizes_spec_named_sqlstate_classes() {
        for code in pg_error_codes::RETRYABLE {
            assert!(pg_error_codes::RETRYABLE.contains(code));
        }
        assert!(!pg_error_codes::RETRYABLE.contains(&"42601"));
    }
}
