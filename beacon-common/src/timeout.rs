use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("timed out after {after:?} while {operation}")]
pub struct TimeoutError {
    pub operation: String,
    pub after: Duration,
}

/// Run `work` with a deadline.
///
/// The work is polled in place, so on timeout its future is dropped and does
/// not keep running in the background. The token handed to `work` is cancelled
/// as soon as the guard returns, either way, so anything the work spawned on
/// its own can stop too.
pub async fn with_timeout<T, E, F, Fut>(
    timeout: Duration,
    operation: &str,
    work: F,
) -> Result<T, E>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
{
    let token = CancellationToken::new();
    let _cancel_on_exit = token.clone().drop_guard();

    match tokio::time::timeout(timeout, work(token.child_token())).await {
        Ok(result) => result,
        Err(_elapsed) => {
            tracing::warn!(?timeout, operation, "operation timed out");
            Err(TimeoutError {
                operation: operation.to_owned(),
                after: timeout,
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum WorkError {
        Failed,
        Timeout(TimeoutError),
    }

    impl From<TimeoutError> for WorkError {
        fn from(error: TimeoutError) -> Self {
            WorkError::Timeout(error)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_result_of_work_within_deadline() {
        let result: Result<u32, WorkError> =
            with_timeout(Duration::from_secs(5), "testing", |_| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(42)
            })
            .await;

        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_error_of_work_within_deadline() {
        let result: Result<u32, WorkError> =
            with_timeout(Duration::from_secs(5), "testing", |_| async {
                Err(WorkError::Failed)
            })
            .await;

        assert_eq!(result, Err(WorkError::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_cancels_work() {
        let finished = Arc::new(AtomicBool::new(false));
        let observed_token = Arc::new(std::sync::Mutex::new(None));

        let work_finished = finished.clone();
        let work_token = observed_token.clone();
        let result: Result<(), WorkError> =
            with_timeout(Duration::from_secs(5), "stopping things", |token| async move {
                *work_token.lock().unwrap() = Some(token);
                tokio::time::sleep(Duration::from_secs(10)).await;
                work_finished.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(
            result,
            Err(WorkError::Timeout(TimeoutError {
                operation: "stopping things".to_owned(),
                after: Duration::from_secs(5),
            }))
        );

        // Give the abandoned work every chance to complete if it were still alive.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!finished.load(Ordering::SeqCst));

        let token = observed_token.lock().unwrap().take().unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_work_observes_cancellation() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let result: Result<(), WorkError> =
            with_timeout(Duration::from_secs(1), "spawning", |token| async move {
                tokio::spawn(async move {
                    token.cancelled().await;
                    _ = done_tx.send(());
                });
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(WorkError::Timeout(_))));
        assert!(done_rx.await.is_ok());
    }
}
