//! Concurrency throttle with request-start pacing.
//!
//! Bounds simultaneously in-flight operations and, when a rate limit is
//! configured, spaces operation *starts* at least `1/rate_limit` seconds
//! apart, measured globally across the throttle instance. Submissions beyond
//! the cap suspend until a slot frees (FIFO, so admission preserves
//! submission order); pacing delays execution, not queueing.

use forge_core::{ForgeError, ForgeResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Throttle configuration.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Hard cap on simultaneously running operations.
    pub max_workers: usize,
    /// Operation starts per second; `None` disables pacing.
    pub rate_limit: Option<f64>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            rate_limit: None,
        }
    }
}

/// Concurrency controller for one provider's work.
pub struct Throttle {
    semaphore: Arc<Semaphore>,
    min_interval: Option<Duration>,
    next_start: Mutex<Instant>,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl Throttle {
    /// Create a throttle; a zero worker cap is treated as one.
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        let workers = config.max_workers.max(1);
        let min_interval = config.rate_limit.and_then(|rate| {
            let interval = 1.0 / rate;
            (rate > 0.0 && interval.is_finite()).then(|| Duration::from_secs_f64(interval))
        });
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            min_interval,
            next_start: Mutex::new(Instant::now()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    /// Acquire a slot, pacing the start when a rate limit is configured.
    ///
    /// # Errors
    /// Only fails if the throttle was torn down (semaphore closed).
    pub async fn acquire(&self) -> ForgeResult<ThrottlePermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ForgeError::internal("throttle semaphore closed"))?;

        if let Some(interval) = self.min_interval {
            let wait = {
                let mut next = self.next_start.lock();
                let now = Instant::now();
                let scheduled = (*next).max(now);
                *next = scheduled + interval;
                scheduled.saturating_duration_since(now)
            };
            if !wait.is_zero() {
                debug!(wait_ms = wait.as_millis(), "pacing operation start");
                tokio::time::sleep(wait).await;
            }
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        Ok(ThrottlePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Run one operation under the throttle.
    ///
    /// # Errors
    /// Only fails if the throttle was torn down.
    pub async fn run<F, Fut, T>(&self, operation: F) -> ForgeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(operation().await)
    }

    /// Operations currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of operations observed running at once.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A slot in a throttle; released (and the gauge decremented) on drop.
pub struct ThrottlePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_acquire_release_updates_gauge() {
        let throttle = Throttle::new(ThrottleConfig {
            max_workers: 2,
            rate_limit: None,
        });

        let first = throttle.acquire().await.expect("acquire");
        assert_eq!(throttle.in_flight(), 1);
        let second = throttle.acquire().await.expect("acquire");
        assert_eq!(throttle.in_flight(), 2);

        drop(first);
        assert_eq!(throttle.in_flight(), 1);
        drop(second);
        assert_eq!(throttle.in_flight(), 0);
        assert_eq!(throttle.peak_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_peak_never_exceeds_cap() {
        let throttle = Arc::new(Throttle::new(ThrottleConfig {
            max_workers: 2,
            rate_limit: None,
        }));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let t = Arc::clone(&throttle);
            handles.push(tokio::spawn(async move {
                let _permit = t.acquire().await.expect("acquire");
                sleep(Duration::from_millis(20)).await;
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        assert_eq!(throttle.peak_in_flight(), 2);
        assert_eq!(throttle.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pacing_spaces_starts() {
        // 20 starts/sec -> at least 50ms between consecutive starts.
        let throttle = Arc::new(Throttle::new(ThrottleConfig {
            max_workers: 4,
            rate_limit: Some(20.0),
        }));

        let started = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let t = Arc::clone(&throttle);
            let log = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                let _permit = t.acquire().await.expect("acquire");
                log.lock().push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }

        let mut times = started.lock().clone();
        times.sort();
        for pair in times.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(gap >= Duration::from_millis(45), "starts too close: {gap:?}");
        }
    }

    #[tokio::test]
    async fn test_run_returns_operation_output() {
        let throttle = Throttle::new(ThrottleConfig::default());
        let value = throttle.run(|| async { 41 + 1 }).await.expect("run");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_zero_workers_clamped_to_one() {
        let throttle = Throttle::new(ThrottleConfig {
            max_workers: 0,
            rate_limit: None,
        });
        let _permit = throttle.acquire().await.expect("acquire");
        assert_eq!(throttle.in_flight(), 1);
    }
}
