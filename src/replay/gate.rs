//! Concurrency Gate
//!
//! Bounds the number of in-flight records, tracks the high-water mark and
//! provides the end-of-run barrier over every unit it spawned.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};

/// In-flight limiter for dispatched records
#[derive(Debug)]
pub struct ConcurrencyGate {
    /// `None` when unlimited
    semaphore: Option<Arc<Semaphore>>,
    limit: usize,
    in_flight: Arc<AtomicUsize>,
    high_water: AtomicUsize,
    tracker: TaskTracker,
}

/// Slot held by one in-flight record; released on drop
#[derive(Debug)]
pub struct GatePermit {
    _permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConcurrencyGate {
    /// Create a gate admitting `limit` records at once, 0 for unlimited.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
            limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            high_water: AtomicUsize::new(0),
            tracker: TaskTracker::new(),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<GatePermit> {
        let permit = match &self.semaphore {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Internal(format!("concurrency gate closed: {}", e)))?,
            ),
            None => None,
        };
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(now, Ordering::AcqRel);
        Ok(GatePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Run `task` as a tracked unit of work.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Wait until every spawned unit has finished. No new units may be
    /// spawned afterwards.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Configured limit, 0 for unlimited
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of records in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.high_water.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_limit_blocks_until_release() {
        let gate = Arc::new(ConcurrencyGate::new(2));
        let first = gate.acquire().await.unwrap();
        let _second = gate.acquire().await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.in_flight(), 2);

        drop(first);
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_unlimited_tracks_high_water() {
        let gate = ConcurrencyGate::new(0);
        let permits: Vec<_> = futures::future::join_all((0..5).map(|_| gate.acquire()))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(gate.in_flight(), 5);
        drop(permits);
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.max_in_flight(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_joins_stragglers() {
        let gate = ConcurrencyGate::new(0);
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let permit = gate.acquire().await.unwrap();
            let done = Arc::clone(&done);
            gate.spawn(async move {
                tokio::time::sleep(Duration::from_millis(100 * (i + 1))).await;
                done.fetch_add(1, Ordering::SeqCst);
                drop(permit);
            });
        }
        gate.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(gate.in_flight(), 0);
    }
}
