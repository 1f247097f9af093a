//! Per-layer token-bucket samplers.
//!
//! Every instrumented layer gets one [`RateCounter`]: a leaky bucket that
//! caps how many sampled requests are actually traced, plus five admission
//! counters that are drained into the periodic metrics document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Token generation rate applied to new counters until the collector says
/// otherwise.
pub const DEFAULT_BUCKET_RATE: f64 = 5.0;
/// Bucket capacity applied to new counters until the collector says otherwise.
pub const DEFAULT_BUCKET_CAPACITY: f64 = 3.0;

/// Snapshot of the five admission counters, taken by [`RateCounter::flush`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RateCounts {
    pub requested: i64,
    pub sampled: i64,
    pub limited: i64,
    pub traced: i64,
    pub through: i64,
}

struct Bucket {
    rate_per_sec: f64,
    capacity: f64,
    available: f64,
    last: Instant,
}

impl Bucket {
    /// Refills the bucket for the wall-clock time elapsed since the last
    /// check. A clock that moves backwards never drains tokens and never
    /// moves `last` backwards.
    fn refill(&mut self, now: Instant) {
        // checked_duration_since only returns None when `now` predates
        // `last` (callers passing stale instants).
        let Some(delta) = now.checked_duration_since(self.last) else {
            return;
        };
        self.last = now;
        let new_tokens = self.rate_per_sec * delta.as_secs_f64();
        self.available = (self.available + new_tokens).min(self.capacity);
    }
}

/// Token bucket plus admission counters for a single layer.
///
/// The counters are plain atomics so the sampling hot path never takes the
/// bucket mutex unless the request was actually sampled.
pub struct RateCounter {
    requested: AtomicI64,
    sampled: AtomicI64,
    limited: AtomicI64,
    traced: AtomicI64,
    through: AtomicI64,
    bucket: Mutex<Bucket>,
}

impl RateCounter {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        RateCounter {
            requested: AtomicI64::new(0),
            sampled: AtomicI64::new(0),
            limited: AtomicI64::new(0),
            traced: AtomicI64::new(0),
            through: AtomicI64::new(0),
            bucket: Mutex::new(Bucket {
                rate_per_sec,
                capacity,
                available: capacity,
                last: Instant::now(),
            }),
        }
    }

    /// Records one sampling decision and runs it through the bucket.
    ///
    /// Returns whether the request is admitted for tracing. `has_metadata`
    /// marks requests that inherited trace context from upstream.
    pub fn count(&self, sampled: bool, has_metadata: bool) -> bool {
        self.count_at(sampled, has_metadata, Instant::now())
    }

    fn count_at(&self, sampled: bool, has_metadata: bool, now: Instant) -> bool {
        self.requested.fetch_add(1, Ordering::Relaxed);
        if has_metadata {
            self.through.fetch_add(1, Ordering::Relaxed);
        }
        if !sampled {
            return false;
        }
        self.sampled.fetch_add(1, Ordering::Relaxed);
        if !self.consume_at(1.0, now) {
            self.limited.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.traced.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn consume_at(&self, size: f64, now: Instant) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.refill(now);
        if bucket.available >= size {
            bucket.available -= size;
            true
        } else {
            false
        }
    }

    /// Installs a new rate and capacity from collector settings. Leftover
    /// tokens carry over but never exceed the new capacity.
    pub fn configure(&self, rate_per_sec: f64, capacity: f64) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.rate_per_sec = rate_per_sec;
        bucket.capacity = capacity;
        bucket.available = bucket.available.min(capacity);
    }

    /// Swaps all five counters back to zero and returns the drained values.
    pub fn flush(&self) -> RateCounts {
        RateCounts {
            requested: self.requested.swap(0, Ordering::Relaxed),
            sampled: self.sampled.swap(0, Ordering::Relaxed),
            limited: self.limited.swap(0, Ordering::Relaxed),
            traced: self.traced.swap(0, Ordering::Relaxed),
            through: self.through.swap(0, Ordering::Relaxed),
        }
    }
}

/// Shared registry of per-layer counters.
///
/// Sampling callers create counters lazily on the first decision for a layer;
/// the metrics task drains every counter once per flush.
pub struct RateCounterRegistry {
    counters: Mutex<HashMap<String, Arc<RateCounter>>>,
}

impl Default for RateCounterRegistry {
    fn default() -> Self {
        RateCounterRegistry {
            counters: Mutex::new(HashMap::new()),
        }
    }
}

impl RateCounterRegistry {
    pub fn get_or_create(&self, layer: &str) -> Arc<RateCounter> {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(counters.entry(layer.to_string()).or_insert_with(|| {
            Arc::new(RateCounter::new(
                DEFAULT_BUCKET_RATE,
                DEFAULT_BUCKET_CAPACITY,
            ))
        }))
    }

    /// Applies a collector-issued bucket configuration to one layer.
    pub fn configure(&self, layer: &str, rate_per_sec: f64, capacity: f64) {
        self.get_or_create(layer).configure(rate_per_sec, capacity);
    }

    /// Restores the default bucket for one layer, used when its setting
    /// expires.
    pub fn restore_defaults(&self, layer: &str) {
        self.configure(layer, DEFAULT_BUCKET_RATE, DEFAULT_BUCKET_CAPACITY);
    }

    /// Drains every layer's counters, sorted by layer name so the resulting
    /// document is stable.
    pub fn flush(&self) -> Vec<(String, RateCounts)> {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let mut drained: Vec<(String, RateCounts)> = counters
            .iter()
            .map(|(layer, counter)| (layer.clone(), counter.flush()))
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unsampled_requests_only_bump_requested_and_through() {
        let counter = RateCounter::new(5.0, 2.0);
        assert!(!counter.count(false, true));
        assert!(!counter.count(false, false));

        let counts = counter.flush();
        assert_eq!(counts.requested, 2);
        assert_eq!(counts.through, 1);
        assert_eq!(counts.sampled, 0);
        assert_eq!(counts.traced, 0);
        assert_eq!(counts.limited, 0);
    }

    #[test]
    fn flush_resets_counters() {
        let counter = RateCounter::new(5.0, 2.0);
        counter.count(true, false);
        assert_ne!(counter.flush().requested, 0);
        assert_eq!(counter.flush(), RateCounts::default());
    }

    #[test]
    fn available_never_exceeds_capacity() {
        let counter = RateCounter::new(1000.0, 1.0);
        let start = Instant::now();
        // A long idle period must still leave exactly one token.
        assert!(counter.count_at(true, false, start + Duration::from_secs(60)));
        assert!(!counter.count_at(true, false, start + Duration::from_secs(60)));
    }

    #[test]
    fn backwards_time_does_not_drain_tokens() {
        let counter = RateCounter::new(5.0, 2.0);
        let start = Instant::now();
        let late = start + Duration::from_secs(10);
        assert!(counter.count_at(true, false, late));
        // Hand the counter an instant that predates the previous refill; the
        // remaining token must survive.
        assert!(counter.count_at(true, false, start));
        assert!(!counter.count_at(true, false, start));
    }

    #[test]
    fn burst_of_consumers_is_rate_limited() {
        // rate=5/s capacity=2, five consumers polling every 33ms for 100
        // rounds: two tokens up front plus ~16.5 refilled over 3.3s.
        let counter = RateCounter::new(5.0, 2.0);
        let start = Instant::now();
        let mut now = start;
        for _ in 0..100 {
            now += Duration::from_millis(33);
            for _ in 0..5 {
                counter.count_at(true, true, now);
            }
        }

        let counts = counter.flush();
        assert_eq!(counts.requested, 500);
        assert_eq!(counts.sampled, 500);
        assert_eq!(counts.through, 500);
        assert_eq!(counts.traced + counts.limited, 500);
        assert!(
            (18..=20).contains(&counts.traced),
            "traced={}",
            counts.traced
        );
    }

    #[test]
    fn sampled_splits_into_traced_and_limited() {
        let counter = RateCounter::new(0.5, 1.0);
        let start = Instant::now();
        for i in 0..50 {
            counter.count_at(true, false, start + Duration::from_millis(i * 10));
        }
        let counts = counter.flush();
        assert_eq!(counts.sampled, counts.traced + counts.limited);
        assert_eq!(counts.requested, counts.sampled);
    }

    #[test]
    fn configure_clamps_leftover_tokens() {
        let counter = RateCounter::new(5.0, 10.0);
        counter.configure(1.0, 1.0);
        let now = Instant::now();
        // Only one token may remain after shrinking the bucket.
        assert!(counter.count_at(true, false, now));
        assert!(!counter.count_at(true, false, now));
    }

    #[test]
    fn registry_reuses_counters_per_layer() {
        let registry = RateCounterRegistry::default();
        let a = registry.get_or_create("web");
        let b = registry.get_or_create("web");
        assert!(Arc::ptr_eq(&a, &b));

        a.count(true, false);
        let drained = registry.flush();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "web");
        assert_eq!(drained[0].1.requested, 1);
    }
}
