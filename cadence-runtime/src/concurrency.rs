//! Bounded run slots
//!
//! A coordinator drives at most `max_concurrent_runs` units at once. Each
//! driven unit holds a [`RunSlot`]; the slot keeps the in-flight gauge in
//! step with the permits handed out, including when a unit's future is
//! dropped mid-run.

use crate::metrics::RUNS_IN_FLIGHT;
use crate::{Error, Result};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::debug;

pub struct ConcurrencyLimiter {
    semaphore: Semaphore,
    max_concurrent: usize,
}

/// Permission to drive one unit; released on drop
#[must_use = "the slot is released as soon as it is dropped"]
pub struct RunSlot<'a> {
    _permit: SemaphorePermit<'a>,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        RUNS_IN_FLIGHT.dec();
    }
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrent),
            max_concurrent,
        }
    }

    /// Wait for a free slot to drive `unit`
    pub async fn acquire(&self, unit: &str) -> Result<RunSlot<'_>> {
        let queued = Instant::now();
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::Internal("run slots closed".to_string()))?;

        let waited = queued.elapsed();
        if !waited.is_zero() {
            debug!(
                unit,
                waited_ms = waited.as_millis() as u64,
                max_concurrent = self.max_concurrent,
                "Waited for a run slot"
            );
        }
        RUNS_IN_FLIGHT.inc();
        Ok(RunSlot { _permit: permit })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slots_are_returned_on_drop() {
        let limiter = ConcurrencyLimiter::new(2);

        let first = limiter.acquire("raw[2024-01-01]").await.unwrap();
        let second = limiter.acquire("raw[2024-01-02]").await.unwrap();
        assert_eq!(limiter.available(), 0);

        drop(second);
        assert_eq!(limiter.available(), 1);
        drop(first);
        assert_eq!(limiter.available(), limiter.max_concurrent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_limiter_waits_for_a_release() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire("raw[2024-01-01]").await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_secs(1), limiter.acquire("raw[2024-01-02]")).await;
        assert!(waiting.is_err(), "second unit got a slot while the only one was held");

        drop(held);
        let next = tokio::time::timeout(Duration::from_secs(1), limiter.acquire("raw[2024-01-02]")).await;
        assert!(next.is_ok());
    }
}
