// ============================================================================
// File: src/async_task.rs
// ----------------------------------------------------------------------------
// AsyncTask handle type and builder used at every async trait seam.
// ============================================================================

use std::future::Future;

/// Handle to a spawned unit of async work
pub type AsyncTask<T> = tokio::task::JoinHandle<T>;

/// Builder that turns a future into an [`AsyncTask`]
///
/// Trait methods return spawned handles instead of `async fn` so that
/// implementations stay object safe and can be stored as `Arc<dyn Trait>`.
pub struct AsyncTaskBuilder<F> {
    future: F,
}

impl<F> AsyncTaskBuilder<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    /// Wrap a future
    pub fn new(future: F) -> Self {
        Self { future }
    }

    /// Spawn the wrapped future on the current tokio runtime
    pub fn spawn(self) -> AsyncTask<F::Output> {
        tokio::spawn(self.future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_task_yields_output() {
        let task = AsyncTaskBuilder::new(async { 21 * 2 }).spawn();
        assert_eq!(task.await.expect("task panicked"), 42);
    }
}
