//! Semaphore-based limit on concurrent uploads.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use shardstream::upload::ConcurrencyLimiter;
//!
//! let limiter = Arc::new(ConcurrencyLimiter::new(8, "upload"));
//!
//! async fn upload(limiter: Arc<ConcurrencyLimiter>) {
//!     let Some(_permit) = limiter.acquire().await else {
//!         return; // closed, nothing more may start
//!     };
//!     // transfer happens here...
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Wraps a Tokio semaphore to bound the number of uploads in flight, with
/// counters for logging and tests.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    /// Semaphore controlling concurrent operations
    semaphore: Arc<Semaphore>,

    /// Maximum permits
    max_permits: usize,

    /// Current number of in-flight operations
    in_flight: AtomicUsize,

    /// Peak concurrent operations observed
    peak_in_flight: AtomicUsize,

    /// Label for this limiter (e.g., "upload")
    label: String,
}

impl ConcurrencyLimiter {
    /// Creates a limiter allowing `max_concurrent` operations at once. A limit
    /// of zero is raised to one.
    pub fn new(max_concurrent: usize, label: impl Into<String>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_permits: max_concurrent,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            label: label.into(),
        }
    }

    /// Waits for a permit. Returns `None` once the limiter is closed.
    pub async fn acquire(&self) -> Option<ConcurrencyPermit<'_>> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        Some(self.track(permit))
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> ConcurrencyPermit<'_> {
        let current = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.update_peak(current);
        ConcurrencyPermit {
            _permit: permit,
            in_flight: &self.in_flight,
        }
    }

    fn update_peak(&self, current: usize) {
        let mut peak = self.peak_in_flight.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_in_flight.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }

    /// Refuse all pending and future acquisitions. Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_permits
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }
}

/// Counts against the limiter until dropped.
pub struct ConcurrencyPermit<'a> {
    _permit: OwnedSemaphorePermit,
    in_flight: &'a AtomicUsize,
}

impl Drop for ConcurrencyPermit<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_limiter() {
        let limiter = ConcurrencyLimiter::new(4, "upload");
        assert_eq!(limiter.max_concurrent(), 4);
        assert_eq!(limiter.in_flight(), 0);
        assert_eq!(limiter.peak_in_flight(), 0);
        assert_eq!(limiter.label(), "upload");
    }

    #[test]
    fn test_zero_is_raised_to_one() {
        assert_eq!(ConcurrencyLimiter::new(0, "upload").max_concurrent(), 1);
    }

    #[tokio::test]
    async fn test_permits_are_tracked() {
        let limiter = ConcurrencyLimiter::new(2, "upload");
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        drop(a);
        assert_eq!(limiter.in_flight(), 1);
        assert_eq!(limiter.peak_in_flight(), 2);
        let _c = limiter.acquire().await.unwrap();
        assert_eq!(limiter.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let limiter = Arc::new(ConcurrencyLimiter::new(3, "upload"));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(limiter.peak_in_flight() <= 3);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_waiters() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1, "upload"));
        let held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.is_none() })
        };
        tokio::task::yield_now().await;
        limiter.close();
        assert!(waiter.await.unwrap());
        drop(held);
        assert!(limiter.acquire().await.is_none());
    }
}
