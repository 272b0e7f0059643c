//! Wall clocks and client-side clock offset estimation.
//!
//! The server stamps every authoritative state change with its own epoch
//! milliseconds. Clients never trust their local clock directly: they probe
//! the server with `time_sync` round trips, estimate
//! `offset = serverClock - localClock`, and translate each
//! `executionTimestamp` into a local delay.
//!
//! ```text
//! client                         server
//!   │── time_sync{clientTime=t0} ──►│
//!   │◄─ reply{serverTime=s} ────────│
//!   t1
//!
//! rtt    = t1 - t0
//! offset = s + rtt/2 - t1
//! delay  = executionTimestamp - (now + offset)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Source of epoch-millisecond timestamps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Number of probes taken by default.
pub const DEFAULT_PROBE_SAMPLES: usize = 3;

/// Averages per-probe offsets into a single estimate.
#[derive(Debug, Clone, Default)]
pub struct ClockOffsetEstimator {
    samples: Vec<f64>,
}

impl ClockOffsetEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one probe.
    ///
    /// `sent_at` and `received_at` are local timestamps around the round
    /// trip, `server_time` is the server's stamp from the reply.
    pub fn add_sample(&mut self, sent_at: u64, server_time: u64, received_at: u64) -> f64 {
        let rtt = received_at.saturating_sub(sent_at) as f64;
        let offset = server_time as f64 + rtt / 2.0 - received_at as f64;
        self.samples.push(offset);
        offset
    }

    /// Mean offset in milliseconds, 0 until the first probe lands.
    pub fn offset_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Local delay before a coordinated action must fire.
///
/// Returns `None` when the client is already late and should apply the
/// action immediately.
pub fn schedule_delay(execution_timestamp: u64, local_now: u64, offset_ms: f64) -> Option<Duration> {
    let server_now = local_now as f64 + offset_ms;
    let delay = execution_timestamp as f64 - server_now;
    if delay <= 0.0 {
        None
    } else {
        Some(Duration::from_millis(delay.round() as u64))
    }
}

/// Sleep until the local instant that corresponds to `execution_timestamp`
/// on the server clock.
pub async fn sleep_until_server_time(execution_timestamp: u64, offset_ms: f64, clock: &dyn Clock) {
    if let Some(delay) = schedule_delay(execution_timestamp, clock.now_ms(), offset_ms) {
        tokio::time::sleep(delay).await;
    }
}
