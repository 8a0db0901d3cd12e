//! General-purpose in-memory caches.
//!
//! Different caches provide different eviction policies suitable for
//! specific use cases. Every cache in this crate is thread-safe and reports
//! approximate usage statistics through [`Stats`].
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use meshmod_cache::{Cache, TtlCache};
//!
//! // 5s default per-entry TTL, at most 500 tracked entries.
//! let cache = TtlCache::new(Duration::from_secs(5)).with_max_entries(500);
//! cache.set("foo", "bar");
//!
//! match cache.get(&"foo") {
//!     Some(value) => println!("got {value}"),
//!     None => println!("value was evicted"),
//! }
//! ```
//!
//! Background eviction is opt-in: [`TtlCache::spawn_eviction`] starts a
//! tokio task that calls [`ExpiringCache::evict_expired`] on a fixed
//! interval and stops once the cache or the returned handle is dropped.

use std::time::Duration;

mod eviction;
mod stats;
mod ttl;

pub use eviction::EvictionTask;
pub use stats::{Stats, StatsCounters};
pub use ttl::TtlCache;

/// Standard behavior of in-memory thread-safe caches.
///
/// Entries may be expunged automatically depending on the eviction policy
/// of the implementation.
pub trait Cache<K, V>: Send + Sync {
    /// Insert an entry, replacing any entry with the same key.
    ///
    /// Replacing counts as a write, never as an eviction.
    fn set(&self, key: K, value: V);

    /// Retrieve the value for `key` if present and not expired.
    fn get(&self, key: &K) -> Option<V>;

    /// Synchronously delete `key`. No effect if the key is absent.
    fn remove(&self, key: &K);

    /// Synchronously delete every entry.
    fn remove_all(&self);

    /// Usage statistics. Values are approximate under concurrent access.
    fn stats(&self) -> Stats;
}

/// A cache whose entries are evicted over time.
pub trait ExpiringCache<K, V>: Cache<K, V> {
    /// Insert an entry with its own time-to-live.
    ///
    /// A zero `ttl` means the entry never expires.
    fn set_with_expiration(&self, key: K, value: V, ttl: Duration);

    /// Synchronously evict every entry whose expiration has passed.
    ///
    /// Returns the number of evicted entries.
    fn evict_expired(&self) -> usize;
}
