//! TTL cache with an optional least-recently-used ceiling.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::eviction::EvictionTask;
use crate::stats::{Stats, StatsCounters};
use crate::{Cache, ExpiringCache};

/// In-memory cache with per-entry expiration.
///
/// Expired entries are never returned by [`Cache::get`]; they stay in memory
/// until [`ExpiringCache::evict_expired`] runs (or the key is rewritten or
/// removed). When a ceiling is configured with [`TtlCache::with_max_entries`]
/// a write that pushes the cache over the ceiling evicts the least recently
/// used entry.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    state: Mutex<State<K, V>>,
    default_ttl: Duration,
    max_entries: Option<usize>,
    stats: StatsCounters,
}

#[derive(Debug)]
struct State<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Access tick -> key, oldest first.
    recency: BTreeMap<u64, K>,
    tick: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    last_access: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl<K, V> State<K, V>
where
    K: Eq + Hash + Clone,
{
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &K) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.last_access);
            entry.last_access = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn take(&mut self, key: &K) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_access);
        Some(entry)
    }

    fn pop_least_recent(&mut self) -> Option<K> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        now.checked_add(ttl)
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache whose entries expire `default_ttl` after being set.
    ///
    /// A zero `default_ttl` disables expiration for [`Cache::set`].
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
            }),
            default_ttl,
            max_entries: None,
            stats: StatsCounters::new(),
        }
    }

    /// Bound the number of tracked entries; the least recently used entry is
    /// evicted when a write exceeds the bound.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    /// Default time-to-live applied by [`Cache::set`].
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Number of entries held, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.lock();

        let tick = state.next_tick();
        if let Some(old) = state.entries.get(&key) {
            let old_tick = old.last_access;
            state.recency.remove(&old_tick);
        }
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key,
            Entry {
                value,
                expires_at: deadline(now, ttl),
                last_access: tick,
            },
        );
        self.stats.record_write();

        if let Some(max) = self.max_entries {
            let mut evicted = 0;
            while state.entries.len() > max {
                if state.pop_least_recent().is_none() {
                    break;
                }
                evicted += 1;
            }
            if evicted > 0 {
                trace!(evicted, max, "evicted least recently used entries");
                self.stats.add_evictions(evicted);
            }
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Start a background task on the current tokio runtime that evicts
    /// expired entries every `interval`.
    ///
    /// The task holds only a weak reference and exits when the cache is
    /// dropped; dropping the returned handle stops it as well.
    pub fn spawn_eviction(self: &Arc<Self>, interval: Duration) -> EvictionTask {
        let weak = Arc::downgrade(self);
        EvictionTask::spawn(interval, move || match weak.upgrade() {
            Some(cache) => {
                cache.evict_expired();
                true
            }
            None => false,
        })
    }
}

impl<K, V> Cache<K, V> for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn set(&self, key: K, value: V) {
        self.insert(key, value, self.default_ttl);
    }

    fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut state = self.lock();

        let value = match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.value.clone(),
            _ => {
                self.stats.record_miss();
                return None;
            }
        };
        state.touch(key);
        self.stats.record_hit();
        Some(value)
    }

    fn remove(&self, key: &K) {
        if self.lock().take(key).is_some() {
            self.stats.add_removals(1);
        }
    }

    fn remove_all(&self) {
        let mut state = self.lock();
        let removed = state.entries.len() as u64;
        state.entries.clear();
        state.recency.clear();
        self.stats.add_removals(removed);
    }

    fn stats(&self) -> Stats {
        self.stats.snapshot()
    }
}

impl<K, V> ExpiringCache<K, V> for TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn set_with_expiration(&self, key: K, value: V, ttl: Duration) {
        self.insert(key, value, ttl);
    }

    fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();

        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.take(key);
        }

        if !expired.is_empty() {
            trace!(evicted = expired.len(), "evicted expired entries");
            self.stats.add_evictions(expired.len() as u64);
        }
        expired.len()
    }
}
