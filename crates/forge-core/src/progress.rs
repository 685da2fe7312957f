//! Rate-limited progress reporting.
//!
//! Progress flows through an explicit channel the caller owns: the caller
//! keeps the receiver, hands the sender to an adapter, and polls or awaits
//! updates. Rate limiting lives in the channel, and a dropped receiver is
//! silently tolerated — a broken progress sink must never abort generation.
//!
//! Transport-layer code may only report fractional progress; 100% is
//! reserved for the layer that has actually validated the output, because an
//! HTTP 200 does not guarantee the body is usable.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Minimum interval between emitted updates.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling for transport-layer progress; only [`ProgressSender::complete`]
/// may go beyond it.
const TRANSPORT_CEILING: f32 = 0.99;

/// One progress update.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    /// Endpoint the update is about.
    pub endpoint_id: String,
    /// Completion fraction in `0.0..=1.0`.
    pub fraction: f32,
}

/// Factory for a progress channel.
#[derive(Debug)]
pub struct ProgressChannel;

impl ProgressChannel {
    /// Create a channel with the default 100ms emission floor.
    #[must_use]
    pub fn new() -> (ProgressSender, watch::Receiver<Progress>) {
        Self::with_min_interval(DEFAULT_MIN_INTERVAL)
    }

    /// Create a channel with a custom emission floor.
    #[must_use]
    pub fn with_min_interval(min_interval: Duration) -> (ProgressSender, watch::Receiver<Progress>) {
        let (tx, rx) = watch::channel(Progress::default());
        (
            ProgressSender {
                tx,
                min_interval,
                last_emit: Arc::new(Mutex::new(None)),
            },
            rx,
        )
    }
}

/// Sending half of a progress channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: watch::Sender<Progress>,
    min_interval: Duration,
    last_emit: Arc<Mutex<Option<Instant>>>,
}

impl ProgressSender {
    /// Report fractional progress for an endpoint.
    ///
    /// Clamped below 100%, rate-limited to the channel's emission floor, and
    /// silently dropped when the receiver is gone.
    pub fn update(&self, endpoint_id: &str, fraction: f32) {
        let fraction = fraction.clamp(0.0, TRANSPORT_CEILING);
        {
            let mut last = self.last_emit.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.min_interval {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        let _ = self.tx.send(Progress {
            endpoint_id: endpoint_id.to_string(),
            fraction,
        });
    }

    /// Report validated completion (100%) for an endpoint.
    ///
    /// Bypasses the rate limit so the terminal update is never lost.
    pub fn complete(&self, endpoint_id: &str) {
        *self.last_emit.lock() = Some(Instant::now());
        let _ = self.tx.send(Progress {
            endpoint_id: endpoint_id.to_string(),
            fraction: 1.0,
        });
    }

    /// Emit simulated fractional progress while a synchronous call is in
    /// flight.
    ///
    /// Advances toward (but never reaches) completion over `horizon`. The
    /// returned guard stops the simulation when dropped.
    #[must_use]
    pub fn simulate(&self, endpoint_id: &str, horizon: Duration) -> SimulationGuard {
        let sender = self.clone();
        let endpoint_id = endpoint_id.to_string();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut tick = tokio::time::interval(Duration::from_millis(200));
            tick.tick().await; // first tick completes immediately
            loop {
                tick.tick().await;
                let elapsed = started.elapsed().as_secs_f32();
                let fraction = (elapsed / horizon.as_secs_f32().max(f32::EPSILON)).min(1.0) * 0.9;
                sender.update(&endpoint_id, fraction);
            }
        });
        SimulationGuard { handle }
    }
}

/// Stops a progress simulation when dropped.
#[derive(Debug)]
pub struct SimulationGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for SimulationGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
