//! Bounded concurrent task runners (SPEC_FULL.md §4.12).
//!
//! Grounded in the teacher's `client::pull::ParallelHandler` (a bounded
//! worker pool fed through a channel, with the caller awaiting a join
//! handle per submitted unit of work) but generalized to return an
//! arbitrary result type instead of `()`.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// A bounded scheduler: at most `capacity` tasks run concurrently. Extra
/// `spawn` calls queue behind the semaphore rather than failing.
#[derive(Clone)]
pub struct TaskRunner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl TaskRunner {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of free slots, for callers implementing a
    /// run-sync-tasks-eagerly escape hatch.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Schedule `task` to run once a slot is free, returning a join handle
    /// the caller can await for completion fan-in.
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("task runner semaphore never closes");
            task.await
        })
    }

    /// The stale-blob-delete runner's escape hatch: if a slot is free right
    /// now, run `task` synchronously on the current task instead of
    /// queueing it, providing backpressure against callers that would
    /// otherwise flood the pool with cleanup work (SPEC_FULL.md §4.12).
    pub async fn run_eagerly_or_spawn<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.semaphore.available_permits() > 0 {
            if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                let result = task.await;
                drop(permit);
                return result;
            }
        }
        self.spawn(task).await.expect("spawned task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_more_tasks_than_capacity_without_deadlock() {
        let runner = TaskRunner::new(2);
        let completed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let completed = completed.clone();
            handles.push(runner.spawn(async move {
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn eager_path_runs_inline_when_capacity_is_free() {
        let runner = TaskRunner::new(4);
        let result = runner.run_eagerly_or_spawn(async { 42 }).await;
        assert_eq!(result, 42);
    }
}
