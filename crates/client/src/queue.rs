//! Bounded-concurrency job queue for part transfers.

use crate::error::{ClientError, ClientResult};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Runs queued jobs with at most `concurrency` in flight.
///
/// Jobs are spawned when pushed and wait for a permit inside their task, so
/// `push` never blocks the caller.
#[derive(Clone)]
pub struct JobQueue {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    closed: Arc<AtomicBool>,
}

impl JobQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tracker: TaskTracker::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn push<F>(&self, job: F) -> ClientResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Session("job queue closed".to_string()));
        }
        let permits = self.permits.clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });
        Ok(())
    }

    /// Jobs queued or running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Refuse further jobs.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tracker.close();
    }

    /// Close and wait for every queued job to finish.
    pub async fn drain(&self) {
        self.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = JobQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let running = running.clone();
            let peak = peak.clone();
            queue
                .push(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        queue.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let queue = JobQueue::new(1);
        queue.close();
        assert!(queue.push(async {}).is_err());
    }
}
