//! Feed health counters for one view context
//!
//! Lock-free counters for what happened to every delivered snapshot, plus a
//! bounded latency sample of the apply step. Exported as a sorted map for
//! logging or a scrape endpoint owned by the embedding application.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters maintained by the subscription manager.
#[derive(Debug)]
pub struct FeedMetrics {
    pub snapshots_received: AtomicU64,
    pub snapshots_accepted: AtomicU64,
    /// Not newer than the history head.
    pub snapshots_rejected: AtomicU64,
    /// Delivered to a handle that was already closed or replaced.
    pub snapshots_discarded: AtomicU64,
    pub snapshots_malformed: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub fatal_errors: AtomicU64,
    apply_ns: Mutex<LatencyTracker>,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self {
            snapshots_received: AtomicU64::new(0),
            snapshots_accepted: AtomicU64::new(0),
            snapshots_rejected: AtomicU64::new(0),
            snapshots_discarded: AtomicU64::new(0),
            snapshots_malformed: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            apply_ns: Mutex::new(LatencyTracker::new(256)),
        }
    }

    pub fn record_received(&self, count: u64) {
        self.snapshots_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_accepted(&self, malformed: bool) {
        self.snapshots_accepted.fetch_add(1, Ordering::Relaxed);
        if malformed {
            self.snapshots_malformed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshots taken over from a whole result set.
    pub fn record_adopted(&self, count: u64) {
        self.snapshots_accepted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.snapshots_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, count: u64) {
        self.snapshots_discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one delivery took to apply.
    pub fn record_apply(&self, latency_ns: u64) {
        if let Ok(mut tracker) = self.apply_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn apply_p99_ns(&self) -> Option<u64> {
        self.apply_ns.lock().ok().and_then(|t| t.percentile(99))
    }

    /// Export counters as a BTreeMap for stable, sorted output.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("snapshots_received".to_string(), self.snapshots_received.load(Ordering::Relaxed));
        m.insert("snapshots_accepted".to_string(), self.snapshots_accepted.load(Ordering::Relaxed));
        m.insert("snapshots_rejected".to_string(), self.snapshots_rejected.load(Ordering::Relaxed));
        m.insert("snapshots_discarded".to_string(), self.snapshots_discarded.load(Ordering::Relaxed));
        m.insert("snapshots_malformed".to_string(), self.snapshots_malformed.load(Ordering::Relaxed));
        m.insert("reconnect_attempts".to_string(), self.reconnect_attempts.load(Ordering::Relaxed));
        m.insert("fatal_errors".to_string(), self.fatal_errors.load(Ordering::Relaxed));
        m
    }
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Most recent `capacity` samples; older ones fall off the front.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, value: u64) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Nearest-rank percentile over the retained samples, `p` in 0..=100.
    pub fn percentile(&self, p: usize) -> Option<u64> {
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();

        let rank = p.min(100) * (sorted.len() - 1) / 100;
        sorted.get(rank).copied()
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
