//! Per-operation retry tracking.
//!
//! One [`RetryTracker`] is created at the start of a single endpoint's
//! generation operation and carried through every layer that may retry:
//! the HTTP transport, the generation operation, and the provider fallback
//! chain. At the end of the operation the tracker is surfaced for logging
//! or attached to the error that aborted the operation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The layer at which a retry attempt happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryLayer {
    /// A single HTTP request attempt inside one provider adapter.
    Http,
    /// One full generation operation (request + recovery) against a provider.
    Generation,
    /// One provider tried by the fallback chain.
    Provider,
}

impl RetryLayer {
    /// Stable lowercase name used in logs and reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Generation => "generation",
            Self::Provider => "provider",
        }
    }
}

impl std::fmt::Display for RetryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded attempt at one layer.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Layer the attempt belongs to.
    pub layer: RetryLayer,
    /// 1-based attempt number within its layer.
    pub attempt: u32,
    /// Why this attempt was made (first attempt, or the error that triggered the retry).
    pub reason: String,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished, if it has.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Backoff wait that preceded this attempt, if any.
    pub wait: Option<Duration>,
}

/// Handle to an in-flight attempt, returned by [`RetryTracker::begin`].
#[derive(Debug, Clone, Copy)]
pub struct AttemptId(usize);

#[derive(Debug)]
struct TrackerInner {
    started: Instant,
    attempts: Vec<RetryAttempt>,
}

/// Ordered record of every retry attempt for one logical operation.
///
/// Cheap to clone; all clones share the same underlying record so the
/// adapter, generation, and fallback layers can append to a single tracker.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

impl RetryTracker {
    /// Start tracking a new operation; captures the wall-clock start.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerInner {
                started: Instant::now(),
                attempts: Vec::new(),
            })),
        }
    }

    /// Record the start of an attempt at `layer`.
    ///
    /// `wait` is the backoff delay that preceded the attempt (None for the
    /// first attempt of a layer). Returns a handle for [`Self::finish`].
    pub fn begin(
        &self,
        layer: RetryLayer,
        reason: impl Into<String>,
        wait: Option<Duration>,
    ) -> AttemptId {
        let mut inner = self.inner.lock();
        let attempt = inner
            .attempts
            .iter()
            .filter(|a| a.layer == layer)
            .count() as u32
            + 1;
        inner.attempts.push(RetryAttempt {
            layer,
            attempt,
            reason: reason.into(),
            started_at: Utc::now(),
            finished_at: None,
            success: false,
            wait,
        });
        AttemptId(inner.attempts.len() - 1)
    }

    /// Mark an attempt as finished.
    pub fn finish(&self, id: AttemptId, success: bool) {
        let mut inner = self.inner.lock();
        if let Some(attempt) = inner.attempts.get_mut(id.0) {
            attempt.finished_at = Some(Utc::now());
            attempt.success = success;
        }
    }

    /// Record a completed attempt in one call.
    pub fn record(
        &self,
        layer: RetryLayer,
        reason: impl Into<String>,
        wait: Option<Duration>,
        success: bool,
    ) {
        let id = self.begin(layer, reason, wait);
        self.finish(id, success);
    }

    /// Snapshot of all attempts at one layer, in order.
    #[must_use]
    pub fn attempts(&self, layer: RetryLayer) -> Vec<RetryAttempt> {
        self.inner
            .lock()
            .attempts
            .iter()
            .filter(|a| a.layer == layer)
            .cloned()
            .collect()
    }

    /// Number of attempts recorded at one layer.
    #[must_use]
    pub fn attempt_count(&self, layer: RetryLayer) -> u32 {
        self.inner
            .lock()
            .attempts
            .iter()
            .filter(|a| a.layer == layer)
            .count() as u32
    }

    /// Number of *retries* at one layer (attempts beyond the first).
    #[must_use]
    pub fn retries(&self, layer: RetryLayer) -> u32 {
        self.attempt_count(layer).saturating_sub(1)
    }

    /// Total attempts across all layers.
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.inner.lock().attempts.len() as u32
    }

    /// Fraction of finished attempts at `layer` that succeeded (0.0 with no attempts).
    #[must_use]
    pub fn success_rate(&self, layer: RetryLayer) -> f64 {
        let inner = self.inner.lock();
        let (total, ok) = inner
            .attempts
            .iter()
            .filter(|a| a.layer == layer)
            .fold((0u32, 0u32), |(t, s), a| (t + 1, s + u32::from(a.success)));
        if total == 0 {
            0.0
        } else {
            f64::from(ok) / f64::from(total)
        }
    }

    /// Sum of all backoff waits recorded before attempts.
    #[must_use]
    pub fn total_retry_wait(&self) -> Duration {
        self.inner
            .lock()
            .attempts
            .iter()
            .filter_map(|a| a.wait)
            .sum()
    }

    /// Wall-clock time since the tracker was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().started.elapsed()
    }

    /// Fraction of the operation's wall-clock time spent waiting to retry.
    #[must_use]
    pub fn retry_time_fraction(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (self.total_retry_wait().as_secs_f64() / elapsed).clamp(0.0, 1.0)
    }

    /// Build a serializable snapshot for logs and surfaced errors.
    #[must_use]
    pub fn report(&self) -> RetryReport {
        let inner = self.inner.lock();
        let mut layers: Vec<LayerReport> = Vec::new();
        for layer in [RetryLayer::Http, RetryLayer::Generation, RetryLayer::Provider] {
            let (mut attempts, mut successes, mut wait) = (0u32, 0u32, Duration::ZERO);
            for a in inner.attempts.iter().filter(|a| a.layer == layer) {
                attempts += 1;
                successes += u32::from(a.success);
                if let Some(w) = a.wait {
                    wait += w;
                }
            }
            if attempts > 0 {
                layers.push(LayerReport {
                    layer,
                    attempts,
                    successes,
                    retries: attempts.saturating_sub(1),
                    total_wait_ms: wait.as_millis() as u64,
                });
            }
        }
        let wall = inner.started.elapsed();
        let total_wait: Duration = inner.attempts.iter().filter_map(|a| a.wait).sum();
        let retry_time_percent = if wall.as_secs_f64() > 0.0 {
            (total_wait.as_secs_f64() / wall.as_secs_f64() * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        RetryReport {
            total_attempts: inner.attempts.len() as u32,
            total_retry_wait_ms: total_wait.as_millis() as u64,
            wall_clock_ms: wall.as_millis() as u64,
            retry_time_percent,
            layers,
        }
    }
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-layer attempt summary inside a [`RetryReport`].
#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    /// The layer summarized.
    pub layer: RetryLayer,
    /// Attempts recorded at this layer.
    pub attempts: u32,
    /// Attempts that succeeded.
    pub successes: u32,
    /// Attempts beyond the first.
    pub retries: u32,
    /// Total backoff wait preceding attempts at this layer.
    pub total_wait_ms: u64,
}

/// Serializable retry summary surfaced with results and errors.
///
/// Lets an operator distinguish "flaky backend" (many HTTP retries, high
/// retry-time percentage) from "misconfiguration" (a single failed attempt)
/// at a glance.
#[derive(Debug, Clone, Serialize)]
pub struct RetryReport {
    /// Attempts across all layers.
    pub total_attempts: u32,
    /// Total backoff wait across all layers.
    pub total_retry_wait_ms: u64,
    /// Wall-clock duration of the operation.
    pub wall_clock_ms: u64,
    /// Percentage of wall-clock time spent waiting to retry.
    pub retry_time_percent: f64,
    /// Per-layer summaries (layers with no attempts are omitted).
    pub layers: Vec<LayerReport>,
}
