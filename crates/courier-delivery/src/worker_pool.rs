//! Bounded worker pool for concurrent message processing.
//!
//! Fans delivery processing out across tokio tasks while capping how many
//! run at once. Submission applies backpressure: when every slot is busy,
//! `submit` waits for one to free up before accepting the task, which in
//! turn stops the owning loop from fetching further ahead of the consumers.

use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::warn;

/// Task pool with a fixed concurrency limit.
///
/// Owned by a single delivery loop; tasks are spawned onto the tokio
/// runtime and tracked so the loop can drain them before exiting.
pub struct WorkerPool {
    capacity: usize,
    slots: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    /// Creates a pool running at most `capacity` tasks concurrently.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, slots: Arc::new(Semaphore::new(capacity)), tasks: JoinSet::new() }
    }

    /// Runs a task on the pool, waiting for a free slot first.
    pub async fn submit<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        // Reap tasks that already finished so the set stays small
        while self.tasks.try_join_next().is_some() {}

        // The semaphore is never closed, so acquisition only fails if the
        // pool itself is gone
        let Ok(permit) = self.slots.clone().acquire_owned().await else {
            return;
        };
        self.tasks.spawn(async move {
            task.await;
            drop(permit);
        });
    }

    /// Waits for every in-flight task to finish.
    pub async fn drain(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(error) = result {
                if error.is_panic() {
                    warn!(error = %error, "pooled task panicked");
                }
            }
        }
    }

    /// Concurrency limit this pool was created with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently free slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn pool_runs_submitted_tasks() {
        let mut pool = WorkerPool::new(4);
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let completed = completed.clone();
            pool.submit(async move {
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        pool.drain().await;

        assert_eq!(completed.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_capacity() {
        let mut pool = WorkerPool::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let running = running.clone();
            let high_water = high_water.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }
        pool.drain().await;

        assert!(high_water.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn submit_waits_when_saturated() {
        let mut pool = WorkerPool::new(1);
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        pool.submit(async move {
            let _ = wait.await;
        })
        .await;
        assert_eq!(pool.available(), 0);

        // The pool is full, so a second submission must not be accepted
        // until the first task completes
        let submitted = Arc::new(AtomicUsize::new(0));
        let observer = submitted.clone();
        let second = async {
            pool.submit(async {}).await;
            observer.fetch_add(1, Ordering::SeqCst);
            pool
        };
        let mut second = Box::pin(second);

        tokio::select! {
            _ = &mut second => unreachable!("submit must block while saturated"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {},
        }
        assert_eq!(submitted.load(Ordering::SeqCst), 0);

        release.send(()).map_err(|_| ()).unwrap();
        let mut pool = second.await;
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
        pool.drain().await;
    }

    #[tokio::test]
    async fn drain_survives_panicking_task() {
        let mut pool = WorkerPool::new(2);
        let completed = Arc::new(AtomicUsize::new(0));

        pool.submit(async {
            panic!("listener blew up");
        })
        .await;
        let observer = completed.clone();
        pool.submit(async move {
            observer.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        pool.drain().await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn zero_capacity_is_promoted_to_one() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.capacity(), 1);
    }
}
