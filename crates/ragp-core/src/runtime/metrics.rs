//! Lock-light runtime instrumentation.
//!
//! The ingress front-end and the shard actors share one `RuntimeMetrics`:
//! a small atomic cell for the guard mode plus atomic counters for queue
//! lengths and totals. Guard-mode transitions are hysteretic so a queue
//! hovering around a watermark does not flap between regimes.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

// ============================================================================
// GUARD MODE
// ============================================================================

/// Ingress backpressure regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GuardMode {
    /// Accept everything
    #[default]
    Normal,
    /// Merge duplicate submissions where possible
    Coalesce,
    /// Refuse new stimuli
    Drop,
}

impl GuardMode {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardMode::Normal => "normal",
            GuardMode::Coalesce => "coalesce",
            GuardMode::Drop => "drop",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            GuardMode::Normal => 0,
            GuardMode::Coalesce => 1,
            GuardMode::Drop => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => GuardMode::Coalesce,
            2 => GuardMode::Drop,
            _ => GuardMode::Normal,
        }
    }
}

impl std::fmt::Display for GuardMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug)]
struct RateWindow {
    last: Option<Instant>,
    last_processed: u64,
    per_sec: f64,
}

/// Shared counters for the async runtime
#[derive(Debug)]
pub(crate) struct RuntimeMetrics {
    global_queue_len: AtomicU64,
    per_shard_queue_len: Vec<AtomicU64>,
    per_shard_processed: Vec<AtomicU64>,
    per_shard_active: Vec<AtomicU64>,
    processed_total: AtomicU64,
    dropped_total: AtomicU64,
    coalesced_total: AtomicU64,
    hop_total: AtomicU64,
    guard_mode: AtomicU8,
    ingress_paused: AtomicBool,
    high_water: AtomicU64,
    low_water: AtomicU64,
    rate: Mutex<RateWindow>,
}

impl RuntimeMetrics {
    pub(crate) fn new(shard_count: usize, high_water: u64, low_water: u64) -> Self {
        Self {
            global_queue_len: AtomicU64::new(0),
            per_shard_queue_len: (0..shard_count).map(|_| AtomicU64::new(0)).collect(),
            per_shard_processed: (0..shard_count).map(|_| AtomicU64::new(0)).collect(),
            per_shard_active: (0..shard_count).map(|_| AtomicU64::new(0)).collect(),
            processed_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            coalesced_total: AtomicU64::new(0),
            hop_total: AtomicU64::new(0),
            guard_mode: AtomicU8::new(GuardMode::Normal.to_u8()),
            ingress_paused: AtomicBool::new(false),
            high_water: AtomicU64::new(high_water),
            low_water: AtomicU64::new(low_water),
            rate: Mutex::new(RateWindow {
                last: None,
                last_processed: 0,
                per_sec: 0.0,
            }),
        }
    }

    pub(crate) fn enqueue(&self, shard: usize) {
        self.global_queue_len.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = self.per_shard_queue_len.get(shard) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn dequeue(&self, shard: usize) {
        let _ = self
            .global_queue_len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
        if let Some(slot) = self.per_shard_queue_len.get(shard) {
            let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        }
    }

    pub(crate) fn processed(&self, shard: usize) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = self.per_shard_processed.get(shard) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn hop(&self) {
        self.hop_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn coalesced(&self, n: u64) {
        self.coalesced_total.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn set_active(&self, shard: usize, count: u64) {
        if let Some(slot) = self.per_shard_active.get(shard) {
            slot.store(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn active_total(&self) -> u64 {
        self.per_shard_active
            .iter()
            .map(|a| a.load(Ordering::Relaxed))
            .sum()
    }

    pub(crate) fn queue_len(&self) -> u64 {
        self.global_queue_len.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn guard(&self) -> GuardMode {
        GuardMode::from_u8(self.guard_mode.load(Ordering::Relaxed))
    }

    pub(crate) fn set_watermarks(&self, high: u64, low: u64) {
        self.high_water.store(high, Ordering::Relaxed);
        self.low_water.store(low, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn paused(&self) -> bool {
        self.ingress_paused.load(Ordering::Acquire)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.ingress_paused.store(paused, Ordering::Release);
    }

    /// Re-evaluate the guard mode from the current queue length.
    ///
    /// Escalation: `high_water` switches to coalesce, twice that to drop.
    /// De-escalation waits for `low_water` (or below `high_water` for the
    /// drop → coalesce step) so the mode does not flap at a boundary.
    pub(crate) fn refresh_guard(&self) -> GuardMode {
        let q = self.queue_len();
        let high = self.high_water.load(Ordering::Relaxed);
        let low = self.low_water.load(Ordering::Relaxed);
        let drop_water = high.saturating_mul(2);
        let current = self.guard();

        let next = match current {
            GuardMode::Normal => {
                if q >= drop_water {
                    GuardMode::Drop
                } else if q >= high {
                    GuardMode::Coalesce
                } else {
                    GuardMode::Normal
                }
            }
            GuardMode::Coalesce => {
                if q >= drop_water {
                    GuardMode::Drop
                } else if q <= low {
                    GuardMode::Normal
                } else {
                    GuardMode::Coalesce
                }
            }
            GuardMode::Drop => {
                if q <= low {
                    GuardMode::Normal
                } else if q < high {
                    GuardMode::Coalesce
                } else {
                    GuardMode::Drop
                }
            }
        };

        if next != current {
            debug!(from = %current, to = %next, queue_len = q, "guard mode transition");
            self.guard_mode.store(next.to_u8(), Ordering::Relaxed);
        }
        next
    }

    /// Counters snapshot for the status surface; refreshes the
    /// processed-per-second estimate when at least 200ms have elapsed.
    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let processed_total = self.processed_total.load(Ordering::Relaxed);
        let per_sec = {
            let mut rate = self.rate.lock().unwrap();
            match rate.last {
                None => {
                    rate.last = Some(Instant::now());
                    rate.last_processed = processed_total;
                }
                Some(last) => {
                    let dt = last.elapsed();
                    if dt.as_millis() >= 200 {
                        let dp = processed_total.saturating_sub(rate.last_processed);
                        rate.per_sec = dp as f64 / dt.as_secs_f64();
                        rate.last = Some(Instant::now());
                        rate.last_processed = processed_total;
                    }
                }
            }
            rate.per_sec
        };

        MetricsSnapshot {
            global_queue_len: self.queue_len(),
            per_shard_queue_len: self
                .per_shard_queue_len
                .iter()
                .map(|a| a.load(Ordering::Relaxed))
                .collect(),
            per_shard_processed: self
                .per_shard_processed
                .iter()
                .map(|a| a.load(Ordering::Relaxed))
                .collect(),
            processed_total,
            processed_per_sec: per_sec,
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            coalesced_total: self.coalesced_total.load(Ordering::Relaxed),
            hop_total: self.hop_total.load(Ordering::Relaxed),
            guard_mode: self.guard(),
            ingress_paused: self.paused(),
        }
    }
}

/// Point-in-time copy of the runtime counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Messages queued across all shards
    pub global_queue_len: u64,
    /// Messages queued per shard
    pub per_shard_queue_len: Vec<u64>,
    /// Messages processed per shard
    pub per_shard_processed: Vec<u64>,
    /// Messages processed in total
    pub processed_total: u64,
    /// Throughput estimate over the last sampling window
    pub processed_per_sec: f64,
    /// Stimuli refused under drop guard mode
    pub dropped_total: u64,
    /// Stimuli merged by ingress coalescing
    pub coalesced_total: u64,
    /// Cross-shard hops emitted
    pub hop_total: u64,
    /// Current backpressure regime
    pub guard_mode: GuardMode,
    /// True while a consolidation barrier holds ingress
    pub ingress_paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_counters_track_enqueue_dequeue() {
        let m = RuntimeMetrics::new(4, 100, 10);
        m.enqueue(1);
        m.enqueue(1);
        m.enqueue(3);
        assert_eq!(m.queue_len(), 3);
        m.dequeue(1);
        assert_eq!(m.queue_len(), 2);
        let snap = m.snapshot();
        assert_eq!(snap.per_shard_queue_len, vec![0, 1, 0, 1]);
    }

    #[test]
    fn dequeue_never_underflows() {
        let m = RuntimeMetrics::new(1, 100, 10);
        m.dequeue(0);
        assert_eq!(m.queue_len(), 0);
    }

    #[test]
    fn guard_escalates_at_high_water_and_reverts_at_low() {
        let m = RuntimeMetrics::new(1, 100, 10);
        assert_eq!(m.refresh_guard(), GuardMode::Normal);

        for _ in 0..100 {
            m.enqueue(0);
        }
        assert_eq!(m.refresh_guard(), GuardMode::Coalesce);

        // Hysteresis: falling just under high water keeps coalescing.
        for _ in 0..50 {
            m.dequeue(0);
        }
        assert_eq!(m.refresh_guard(), GuardMode::Coalesce);

        for _ in 0..40 {
            m.dequeue(0);
        }
        assert_eq!(m.refresh_guard(), GuardMode::Normal);
    }

    #[test]
    fn guard_drops_at_twice_high_water() {
        let m = RuntimeMetrics::new(1, 100, 10);
        for _ in 0..200 {
            m.enqueue(0);
        }
        assert_eq!(m.refresh_guard(), GuardMode::Drop);

        // Back under high water: drop relaxes to coalesce first.
        for _ in 0..150 {
            m.dequeue(0);
        }
        assert_eq!(m.refresh_guard(), GuardMode::Coalesce);
        for _ in 0..45 {
            m.dequeue(0);
        }
        assert_eq!(m.refresh_guard(), GuardMode::Normal);
    }
}
