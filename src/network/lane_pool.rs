//! Admission pool bounding the number of lanes with a live connection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::futures::Notified;
use tokio::sync::{Notify, Semaphore};

use crate::{ReplayError, Result};

use super::MAX_LANES;

/// Pool of connection slots shared by every lane.
///
/// A lane holds a [`LaneGuard`] for as long as its live connection is open.
/// Lanes waiting for a slot are counted so that idle lanes can step aside.
#[derive(Clone)]
pub struct LanePool {
    semaphore: Arc<Semaphore>,
    active_count: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
    contended: Arc<Notify>,
    max_lanes: usize,
}

impl LanePool {
    /// Create a new pool
    ///
    /// # Panics
    ///
    /// Panics if `max_lanes` is 0
    #[must_use]
    pub fn new(max_lanes: usize) -> Self {
        assert!(max_lanes > 0, "max_lanes must be > 0");

        Self {
            semaphore: Arc::new(Semaphore::new(max_lanes)),
            active_count: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
            contended: Arc::new(Notify::new()),
            max_lanes,
        }
    }

    /// Try to acquire a slot without waiting
    ///
    /// Returns `None` if no slots are available
    pub fn try_acquire(&self) -> Option<LaneGuard> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.active_count.fetch_add(1, Ordering::Relaxed);
                Some(LaneGuard {
                    _permit: permit,
                    active_count: Arc::clone(&self.active_count),
                })
            }
            Err(_) => None,
        }
    }

    /// Acquire a slot, waiting for one to free up if necessary
    ///
    /// # Errors
    ///
    /// Returns error if the pool has been closed
    pub async fn acquire(&self) -> Result<LaneGuard> {
        if let Some(guard) = self.try_acquire() {
            return Ok(guard);
        }

        let _waiter = WaiterGuard::new(&self.waiting);
        self.contended.notify_waiters();

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| ReplayError::Other(format!("Lane pool closed: {e}")))?;

        self.active_count.fetch_add(1, Ordering::Relaxed);

        Ok(LaneGuard {
            _permit: permit,
            active_count: Arc::clone(&self.active_count),
        })
    }

    /// Whether some lane is waiting for a slot
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        self.waiting.load(Ordering::Acquire) > 0
    }

    /// Resolves the next time a lane starts waiting for a slot.
    ///
    /// The returned future observes notifications from the moment it is
    /// created, even before it is first polled.
    pub fn contended(&self) -> Notified<'_> {
        self.contended.notified()
    }

    /// Get the current number of lanes holding a slot
    #[must_use]
    pub fn active_lanes(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Get the maximum number of lanes
    #[must_use]
    pub fn max_lanes(&self) -> usize {
        self.max_lanes
    }
}

impl Default for LanePool {
    fn default() -> Self {
        Self::new(MAX_LANES)
    }
}

struct WaiterGuard<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
    fn new(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::AcqRel);
        Self { waiting }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Guard that releases a lane slot when dropped
pub struct LaneGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
    active_count: Arc<AtomicUsize>,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lane_pool_basic() {
        let pool = LanePool::new(2);

        assert_eq!(pool.active_lanes(), 0);
        assert_eq!(pool.max_lanes(), 2);
        assert!(!pool.has_waiters());
    }

    #[tokio::test]
    async fn test_lane_pool_acquire_release() {
        let pool = LanePool::new(2);

        {
            let _guard1 = pool.acquire().await.unwrap();
            let _guard2 = pool.acquire().await.unwrap();
            assert_eq!(pool.active_lanes(), 2);
            assert!(pool.try_acquire().is_none());
        }

        assert_eq!(pool.active_lanes(), 0);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_waiters_are_counted_and_announced() {
        let pool = LanePool::new(1);
        let guard = pool.acquire().await.unwrap();

        let contended = pool.contended();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::timeout(Duration::from_secs(1), contended)
            .await
            .expect("waiter should announce itself");
        assert!(pool.has_waiters());

        drop(guard);
        waiter.await.unwrap().unwrap();
        assert!(!pool.has_waiters());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_uncounted() {
        let pool = LanePool::new(1);
        let _guard = pool.acquire().await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(result.is_err());
        assert!(!pool.has_waiters());
    }

    #[test]
    #[should_panic(expected = "max_lanes must be > 0")]
    fn test_lane_pool_zero_panic() {
        let _ = LanePool::new(0);
    }
}
