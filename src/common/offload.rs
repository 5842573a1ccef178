//! Off-path execution for expensive read-only work.
//!
//! Work runs on the blocking pool and reports back through a oneshot channel.
//! Cancellation is best-effort: a job that has started always runs to
//! completion, and its result is dropped if the requester is gone.

use tokio::sync::oneshot;

use crate::common::error::OffloadError;

/// Start `work` off the caller's task and return the receiving half.
///
/// Must be called from within a tokio runtime.
pub fn dispatch<T, F>(name: &'static str, work: F) -> oneshot::Receiver<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let result = work();
        if tx.send(result).is_err() {
            tracing::debug!(job = name, "requester gone, discarding result");
        }
    });
    rx
}

/// Run `work` off the caller's task and wait for its result
pub async fn run<T, F>(name: &'static str, work: F) -> Result<T, OffloadError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    dispatch(name, work)
        .await
        .map_err(|_| OffloadError::Aborted { name })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_result() {
        let value = run("sum", || (1..=4).sum::<u32>()).await.unwrap();
        assert_eq!(value, 10);
    }

    #[tokio::test]
    async fn test_panicking_job_reports_aborted() {
        let result: Result<(), _> = run("boom", || panic!("job failed")).await;
        assert!(matches!(result, Err(OffloadError::Aborted { name: "boom" })));
    }

    #[tokio::test]
    async fn test_dropped_requester_lets_job_finish() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let rx = dispatch("slow", move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::SeqCst);
        });
        drop(rx);

        for _ in 0..100 {
            if finished.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(finished.load(Ordering::SeqCst));
    }
}
