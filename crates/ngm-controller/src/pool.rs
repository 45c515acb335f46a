//! Bounded worker pool for fan-out reads.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

/// Runs jobs on the tokio runtime with at most `concurrency` in flight.
#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every job and wait for all of them.
    ///
    /// Results come back in submission order. A job that panics yields
    /// `None`.
    pub async fn run_all<T, Fut>(&self, jobs: Vec<Fut>) -> Vec<Option<T>>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut results: Vec<Option<T>> = (0..jobs.len()).map(|_| None).collect();
        let mut set = JoinSet::new();
        for (idx, job) in jobs.into_iter().enumerate() {
            let semaphore = self.semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (idx, job.await)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, value)) => results[idx] = Some(value),
                Err(e) => error!(error = %e, "worker job failed"),
            }
        }
        results
    }
}
