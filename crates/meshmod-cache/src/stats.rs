//! Usage statistics shared by every cache in the process.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Usage statistics about an individual cache.
///
/// The values are approximations of the current state of the cache: counters
/// are updated with relaxed atomics and may briefly lag behind concurrent
/// operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Number of times state in the cache was added or updated.
    pub writes: u64,

    /// Number of lookups that found a live entry.
    pub hits: u64,

    /// Number of lookups that found nothing (or only an expired entry).
    pub misses: u64,

    /// Number of entries removed by an eviction policy.
    pub evictions: u64,

    /// Number of entries explicitly removed.
    pub removals: u64,
}

/// Monotonic atomic counters backing [`Stats`].
#[derive(Debug, Default)]
pub struct StatsCounters {
    writes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    removals: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_removals(&self, n: u64) {
        self.removals.fetch_add(n, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters.
    pub fn snapshot(&self) -> Stats {
        Stats {
            writes: self.writes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}
