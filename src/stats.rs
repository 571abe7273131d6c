use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// A point-in-time view of a handle's diagnostic counters.
///
/// Purely informational; nothing in the library branches on these values.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CollectionStats {
    pub reads: u64,
    pub writes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub average_query_latency_ms: f64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct StatsRecorder {
    reads: AtomicU64,
    writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    latency_total_micros: AtomicU64,
    latency_samples: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query_latency(&self, elapsed: Duration) {
        self.latency_total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Some(Utc::now());
    }

    pub fn snapshot(&self) -> CollectionStats {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let samples = self.latency_samples.load(Ordering::Relaxed);
        CollectionStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            average_query_latency_ms: if samples == 0 {
                0.0
            } else {
                self.latency_total_micros.load(Ordering::Relaxed) as f64
                    / samples as f64
                    / 1000.0
            },
            last_activity: *self.last_activity.lock().unwrap(),
        }
    }
}
