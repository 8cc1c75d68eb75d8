//! Bounded pool for independent runs. Layers within one run stay serial;
//! distinct run ids proceed concurrently up to the pool size.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;

use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// `size == 0` means one worker per CPU.
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { num_cpus::get().max(1) } else { size };
        Self { permits: Arc::new(Semaphore::new(size)), size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawn every job, at most `size` at a time, and return results in
    /// submission order. A panicked job is reported as `None`.
    pub async fn run_all<F, Fut, T>(&self, jobs: Vec<F>) -> Vec<Option<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let permits = self.permits.clone();
                tokio::spawn(async move {
                    // the semaphore is never closed
                    let _permit = permits.acquire_owned().await.ok();
                    job().await
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(i, res)| match res {
                Ok(v) => Some(v),
                Err(e) => {
                    log(
                        Level::Error,
                        Domain::Orchestrator,
                        "worker_failed",
                        obj(&[("job", v_num(i as f64)), ("error", v_str(&e.to_string()))]),
                    );
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let pool = WorkerPool::new(2);
        let jobs: Vec<_> = (0..5u64)
            .map(|i| {
                move || async move {
                    tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                    i
                }
            })
            .collect();
        let out = pool.run_all(jobs).await;
        assert_eq!(out, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_size() {
        let pool = WorkerPool::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs: Vec<_> = (0..6)
            .map(|_| {
                let active = active.clone();
                let peak = peak.clone();
                move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();
        pool.run_all(jobs).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_means_cpu_count() {
        assert!(WorkerPool::new(0).size() >= 1);
    }
}
