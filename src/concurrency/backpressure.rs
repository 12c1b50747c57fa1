//! In-flight gate for event handlers.
//!
//! The dispatcher takes a permit before spawning a handler and moves it into
//! the task; the permit is released when the handler finishes. Once all
//! permits are out, `acquire` waits and the dispatch loop stops reading.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

pub struct Backpressure {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    waiting_count: Arc<AtomicUsize>,
    saturated_count: Arc<AtomicU64>,
    total_count: Arc<AtomicU64>,
}

impl Backpressure {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            waiting_count: Arc::new(AtomicUsize::new(0)),
            saturated_count: Arc::new(AtomicU64::new(0)),
            total_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wait for a free slot. `None` once the gate is closed.
    pub async fn acquire(&self) -> Option<BackpressurePermit> {
        self.total_count.fetch_add(1, Ordering::Relaxed);

        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Some(BackpressurePermit::new(permit));
        }

        self.saturated_count.fetch_add(1, Ordering::Relaxed);
        self.waiting_count.fetch_add(1, Ordering::SeqCst);
        trace!(max_in_flight = self.max_in_flight, "in-flight limit reached, waiting");
        let permit = Arc::clone(&self.semaphore).acquire_owned().await;
        self.waiting_count.fetch_sub(1, Ordering::SeqCst);

        permit.ok().map(BackpressurePermit::new)
    }

    pub fn try_acquire(&self) -> Option<BackpressurePermit> {
        self.total_count.fetch_add(1, Ordering::Relaxed);
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(BackpressurePermit::new(permit)),
            Err(_) => {
                self.saturated_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Wake every waiter with `None`; outstanding permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active_count(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting_count.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            max_in_flight: self.max_in_flight,
            active_count: self.active_count(),
            waiting_count: self.waiting_count(),
            saturated_count: self.saturated_count.load(Ordering::Relaxed),
            total_count: self.total_count.load(Ordering::Relaxed),
        }
    }
}

impl Clone for Backpressure {
    fn clone(&self) -> Self {
        Self {
            semaphore: Arc::clone(&self.semaphore),
            max_in_flight: self.max_in_flight,
            waiting_count: Arc::clone(&self.waiting_count),
            saturated_count: Arc::clone(&self.saturated_count),
            total_count: Arc::clone(&self.total_count),
        }
    }
}

/// Held for the lifetime of one handler.
#[derive(Debug)]
pub struct BackpressurePermit {
    _permit: OwnedSemaphorePermit,
    acquired_at: Instant,
}

impl BackpressurePermit {
    fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            _permit: permit,
            acquired_at: Instant::now(),
        }
    }

    pub fn held_duration(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackpressureStats {
    pub max_in_flight: usize,
    pub active_count: usize,
    pub waiting_count: usize,
    /// Acquisitions that found the gate full
    pub saturated_count: u64,
    pub total_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backpressure_acquire() {
        let bp = Backpressure::new(2);

        let _permit1 = bp.acquire().await.unwrap();
        let _permit2 = bp.acquire().await.unwrap();

        assert_eq!(bp.active_count(), 2);
        assert_eq!(bp.available_permits(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_try_acquire() {
        let bp = Backpressure::new(1);

        let held = bp.try_acquire();
        assert!(held.is_some());
        assert!(bp.try_acquire().is_none());
        assert_eq!(bp.stats().saturated_count, 1);

        drop(held);
        assert!(bp.try_acquire().is_some());
    }

    #[tokio::test]
    async fn zero_limit_still_admits_one() {
        let bp = Backpressure::new(0);
        assert_eq!(bp.max_in_flight(), 1);
        assert!(bp.try_acquire().is_some());
    }

    #[tokio::test]
    async fn waiter_resumes_when_permit_released() {
        let bp = Backpressure::new(1);
        let held = bp.acquire().await.unwrap();

        let waiter = {
            let bp = bp.clone();
            tokio::spawn(async move { bp.acquire().await.is_some() })
        };
        while bp.waiting_count() == 0 {
            tokio::task::yield_now().await;
        }

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_none() {
        let bp = Backpressure::new(1);
        let _held = bp.acquire().await.unwrap();

        let waiter = {
            let bp = bp.clone();
            tokio::spawn(async move { bp.acquire().await.is_none() })
        };
        while bp.waiting_count() == 0 {
            tokio::task::yield_now().await;
        }

        bp.close();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_backpressure_stats() {
        let bp = Backpressure::new(5);
        let _permit = bp.acquire().await.unwrap();

        let stats = bp.stats();
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.max_in_flight, 5);
        assert_eq!(stats.total_count, 1);
        assert_eq!(stats.saturated_count, 0);
    }
}
