//! Per-session admission control for generation pipelines

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrently generating replies per session
pub const DEFAULT_CAPACITY: usize = 2;

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicUsize,
    released: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Point-in-time view of the permit counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionStats {
    pub acquired: usize,
    pub released: usize,
    pub in_flight: usize,
    pub peak: usize,
}

/// Counting permit pool bounding concurrent generation pipelines
///
/// Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct Admission {
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl Admission {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(Counters::default()),
            capacity,
        }
    }

    /// Wait for a free permit
    ///
    /// Returns `None` once the pool has been closed.
    pub async fn acquire(&self) -> Option<Permit> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;

        let counters = &self.counters;
        counters.acquired.fetch_add(1, Ordering::SeqCst);
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(now, Ordering::SeqCst);

        Some(Permit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        })
    }

    /// Fail all current and future waiters
    pub fn close(&self) {
        self.semaphore.close();
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let c = &self.counters;
        AdmissionStats {
            acquired: c.acquired.load(Ordering::SeqCst),
            released: c.released.load(Ordering::SeqCst),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            peak: c.peak.load(Ordering::SeqCst),
        }
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An acquired admission slot, released exactly once on drop
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::task::JoinSet;

    use super::*;

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let admission = Admission::new(2);
        let mut set = JoinSet::new();

        for _ in 0..8 {
            let admission = admission.clone();
            set.spawn(async move {
                let _permit = admission.acquire().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            });
        }
        while set.join_next().await.is_some() {}

        let stats = admission.stats();
        assert!(stats.peak <= 2, "peak was {}", stats.peak);
        assert_eq!(stats.acquired, 8);
        assert_eq!(stats.released, 8);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(admission.available(), 2);
    }

    #[tokio::test]
    async fn third_acquire_waits_for_release() {
        let admission = Admission::new(2);
        let first = admission.acquire().await.unwrap();
        let _second = admission.acquire().await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(20), admission.acquire()).await;
        assert!(pending.is_err());

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(100), admission.acquire()).await;
        assert!(matches!(third, Ok(Some(_))));
    }

    #[tokio::test]
    async fn release_happens_once_per_permit() {
        let admission = Admission::new(2);
        let permit = admission.acquire().await.unwrap();
        drop(permit);

        let stats = admission.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(admission.available(), 2);
    }

    #[tokio::test]
    async fn closed_pool_rejects_waiters() {
        let admission = Admission::new(1);
        let _held = admission.acquire().await.unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await.is_none() })
        };
        tokio::task::yield_now().await;
        admission.close();

        assert!(waiter.await.unwrap());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(Admission::new(0).capacity(), 1);
    }
}
