//! Admission gate for CRUD tasks.
//!
//! `submit` waits for a semaphore permit before spawning, so the caller is
//! throttled once `max_parallel` tasks are running. `drain` is the batch
//! barrier: it joins everything submitted since the last drain. A panicking
//! task is counted and otherwise ignored; it never aborts its siblings.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Default bound on concurrently running tasks.
pub const DEFAULT_MAX_PARALLEL: usize = 20;

/// Results of one drained batch.
#[derive(Debug)]
pub struct Drained<T> {
    pub completed: Vec<T>,
    pub panicked: usize,
    /// Highest number of tasks observed running at once during the batch.
    pub peak_running: usize,
}

pub struct ConcurrencyLimiter<T> {
    max_parallel: usize,
    permits: Arc<Semaphore>,
    tasks: JoinSet<T>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl<T: Send + 'static> ConcurrencyLimiter<T> {
    pub fn new(max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            max_parallel,
            permits: Arc::new(Semaphore::new(max_parallel)),
            tasks: JoinSet::new(),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Tasks currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_parallel - self.permits.available_permits()
    }

    /// Wait for a free slot, then spawn `work`.
    pub async fn submit<F>(&mut self, work: F) -> anyhow::Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("concurrency limiter closed")?;
        let running = self.running.clone();
        let peak = self.peak.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            let _running = Running::enter(running, &peak);
            work.await
        });
        Ok(())
    }

    /// Wait for every submitted task to finish.
    pub async fn drain(&mut self) -> Drained<T> {
        let mut completed = Vec::with_capacity(self.tasks.len());
        let mut panicked = 0;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(value) => completed.push(value),
                Err(err) => {
                    panicked += 1;
                    warn!(error = %err, "task did not complete");
                }
            }
        }
        Drained {
            completed,
            panicked,
            peak_running: self.peak.swap(0, Ordering::SeqCst),
        }
    }
}

/// Running-task gauge held for the lifetime of one task.
struct Running {
    gauge: Arc<AtomicUsize>,
}

impl Running {
    fn enter(gauge: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { gauge }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn running_tasks_never_exceed_bound() {
        let mut limiter = ConcurrencyLimiter::new(3);
        for idx in 0..30u32 {
            limiter
                .submit(async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    idx
                })
                .await
                .expect("submit");
            assert!(limiter.in_flight() <= 3);
        }
        let drained = limiter.drain().await;
        assert_eq!(drained.completed.len(), 30);
        assert_eq!(drained.panicked, 0);
        assert!(drained.peak_running <= 3);
        assert!(drained.peak_running >= 1);
        let mut seen = drained.completed;
        seen.sort_unstable();
        assert_eq!(seen, (0..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn panicking_task_does_not_poison_batch() {
        let mut limiter = ConcurrencyLimiter::new(2);
        limiter.submit(async { 1 }).await.expect("submit");
        limiter
            .submit(async {
                if true {
                    panic!("boom");
                }
                2
            })
            .await
            .expect("submit");
        limiter.submit(async { 3 }).await.expect("submit");
        let drained = limiter.drain().await;
        assert_eq!(drained.panicked, 1);
        assert_eq!(drained.completed.len(), 2);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_on_empty_batch_returns_immediately() {
        let mut limiter = ConcurrencyLimiter::<()>::new(0);
        assert_eq!(limiter.max_parallel(), 1);
        let drained = limiter.drain().await;
        assert!(drained.completed.is_empty());
        assert_eq!(drained.peak_running, 0);
    }
}
