//! Bounded retries under a per-query deadline.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::debug;

/// The query's deadline passed before an answer was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Run `operation` up to `attempts` times, waiting `delay` between failures.
///
/// `attempts` is clamped to at least one. Every attempt and every wait is
/// raced against `deadline`: once it passes, the call returns
/// [`DeadlineExceeded`] without waiting out the delay or trying again, so the
/// total latency never exceeds the deadline.
pub async fn query_with_retry<T, E, F, Fut>(
    deadline: Instant,
    attempts: usize,
    delay: Duration,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DeadlineExceeded> + std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match timeout_at(deadline, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => return Err(DeadlineExceeded.into()),
        };

        if attempt >= attempts {
            return Err(err);
        }
        debug!(attempt, attempts, error = %err, "attempt failed, retrying");

        let wake = Instant::now() + delay;
        if wake >= deadline {
            sleep_until(deadline).await;
            return Err(DeadlineExceeded.into());
        }
        sleep_until(wake).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed(usize),
        Deadline,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl From<DeadlineExceeded> for TestError {
        fn from(_: DeadlineExceeded) -> Self {
            TestError::Deadline
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn succeeds_after_retries() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result = query_with_retry(far_deadline(), 3, Duration::from_millis(10), || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(TestError::Failed(n)) } else { Ok(n) }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), _> =
            query_with_retry(far_deadline(), 4, Duration::from_millis(1), || {
                let calls = calls.clone();
                async move { Err(TestError::Failed(calls.fetch_add(1, Ordering::SeqCst) + 1)) }
            })
            .await;

        assert_eq!(result, Err(TestError::Failed(4)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn first_success_stops_retrying() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result = query_with_retry(far_deadline(), 5, Duration::from_millis(10), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>("answer")
            }
        })
        .await;

        assert_eq!(result, Ok("answer"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), _> = query_with_retry(far_deadline(), 0, Duration::ZERO, || {
            let calls = calls.clone();
            async move { Err(TestError::Failed(calls.fetch_add(1, Ordering::SeqCst) + 1)) }
        })
        .await;

        assert_eq!(result, Err(TestError::Failed(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn honors_deadline_during_backoff() {
        let deadline = Instant::now() + Duration::from_millis(15);
        let start = std::time::Instant::now();

        let result: Result<(), _> =
            query_with_retry(deadline, 3, Duration::from_millis(20), || async {
                Err(TestError::Failed(0))
            })
            .await;

        assert_eq!(result, Err(TestError::Deadline));
        assert!(
            start.elapsed() < Duration::from_millis(50),
            "took {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn slow_attempt_is_cut_at_deadline() {
        let deadline = Instant::now() + Duration::from_millis(20);
        let start = std::time::Instant::now();

        let result: Result<(), TestError> =
            query_with_retry(deadline, 3, Duration::ZERO, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert_eq!(result, Err(TestError::Deadline));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
