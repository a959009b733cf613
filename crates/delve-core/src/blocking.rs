//! Offloading synchronous work from the async runtime.
//!
//! Cache store backends do blocking file and SQLite I/O; callers on the async
//! path hand that work to Tokio's blocking threadpool through [`run_blocking`].

use tokio::task::JoinError;

use crate::Error;

/// Execute a blocking closure on Tokio's blocking threadpool.
///
/// A panic in the blocking task surfaces as [`Error::Unknown`] and a task
/// dropped by a shutting-down runtime as [`Error::Cancelled`], instead of
/// tearing down the caller.
///
/// # Example
///
/// ```ignore
/// let store = Arc::clone(&self.store);
/// let entry = run_blocking(move || store.get(&fingerprint)).await??;
/// ```
pub async fn run_blocking<F, T>(f: F) -> Result<T, Error>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(join_error)
}

fn join_error(err: JoinError) -> Error {
    if err.is_cancelled() {
        Error::Cancelled
    } else {
        Error::Unknown(format!("Blocking task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let value = run_blocking(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_blocking_panic_is_error() {
        let result: Result<(), Error> = run_blocking(|| panic!("boom")).await;
        assert!(matches!(result, Err(Error::Unknown(_))));
    }

    #[tokio::test]
    async fn test_aborted_task_is_cancelled() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        let err = handle.await.unwrap_err();
        assert!(matches!(join_error(err), Error::Cancelled));
    }
}
