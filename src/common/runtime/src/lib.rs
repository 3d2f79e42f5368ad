//! Async runtime utilities for Strata.
//!
//! Provides task spawning helpers and the bounded channel primitives the
//! pipeline model is built on. Pipeline stages are functions from an input
//! channel to an output channel; every stage yields to the scheduler at
//! least once per processed item so no single query can starve the loop.

use std::future::Future;
use std::sync::Arc;

use common_error::{StrataError, StrataResult};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

/// Get or create a Tokio runtime for blocking operations.
pub fn get_runtime() -> StrataResult<Runtime> {
    Runtime::new().map_err(|e| StrataError::internal(format!("Failed to create runtime: {e}")))
}

/// Block on a future using the default runtime.
pub fn block_on<F: Future>(future: F) -> StrataResult<F::Output> {
    let runtime = get_runtime()?;
    Ok(runtime.block_on(future))
}

/// Spawn a task on the current runtime.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}

/// Yield control to the scheduler.
///
/// Pipeline stages call this once per processed item.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

/// A handle to a set of spawned tasks.
pub struct JoinSet<T> {
    inner: tokio::task::JoinSet<T>,
}

impl<T: Send + 'static> JoinSet<T> {
    /// Create a new join set.
    pub fn new() -> Self {
        Self {
            inner: tokio::task::JoinSet::new(),
        }
    }

    /// Spawn a task into the set.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.inner.spawn(future);
    }

    /// Wait for the next task to complete.
    pub async fn join_next(&mut self) -> Option<Result<T, tokio::task::JoinError>> {
        self.inner.join_next().await
    }

    /// Abort every task in the set.
    pub fn abort_all(&mut self) {
        self.inner.abort_all();
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get the number of tasks in the set.
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<T: Send + 'static> Default for JoinSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a bounded pipe between two pipeline stages.
///
/// The bound provides backpressure: a slow consumer throttles producers.
pub fn pipe<T>(capacity: usize) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
    mpsc::channel(capacity)
}

/// A cloneable hand-off over a single bounded receiver.
///
/// Fan-out workers share one input queue; each `recv` hands the next item
/// to exactly one worker.
pub struct SharedReceiver<T> {
    inner: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedReceiver<T> {
    /// Wrap a receiver for shared consumption.
    pub fn new(recv: mpsc::Receiver<T>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(recv)),
        }
    }

    /// Receive the next item, or `None` once the channel is closed.
    pub async fn recv(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_backpressure() {
        let (tx, mut rx) = pipe::<u64>(2);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert!(tx.try_send(3).is_err());
        assert_eq!(rx.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_shared_receiver() {
        let (tx, rx) = pipe::<u64>(8);
        let shared = SharedReceiver::new(rx);

        for i in 0..4 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        let a = shared.clone();
        let b = shared.clone();
        while let Some(item) = a.recv().await {
            seen.push(item);
            if let Some(item) = b.recv().await {
                seen.push(item);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_join_set() {
        let mut set = JoinSet::new();
        for i in 0..3u64 {
            set.spawn(async move { i * 2 });
        }

        let mut total = 0;
        while let Some(res) = set.join_next().await {
            total += res.unwrap();
        }
        assert_eq!(total, 6);
        assert!(set.is_empty());
    }
}
