//! Integration tests for TtlCache used through the cache traits.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use meshmod_cache::{Cache, ExpiringCache, TtlCache};

fn fill<C: ExpiringCache<String, u64>>(cache: &C, prefix: &str, n: u64, ttl: Duration) {
    for i in 0..n {
        cache.set_with_expiration(format!("{}-{}", prefix, i), i, ttl);
    }
}

#[test]
fn test_concurrent_writers_and_readers() {
    let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || {
                for i in 0..100u64 {
                    let key = format!("{}-{}", t, i);
                    cache.set(key.clone(), i);
                    assert_eq!(cache.get(&key), Some(i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.writes, 800);
    assert_eq!(stats.hits, 800);
    assert_eq!(cache.len(), 800);
}

#[test]
fn test_mixed_expirations_through_trait() {
    let cache = TtlCache::new(Duration::ZERO);
    fill(&cache, "short", 5, Duration::from_millis(10));
    fill(&cache, "long", 5, Duration::from_secs(60));
    thread::sleep(Duration::from_millis(50));

    assert_eq!(cache.evict_expired(), 5);
    assert_eq!(cache.get(&"long-3".to_string()), Some(3));
    assert_eq!(cache.get(&"short-3".to_string()), None);
}

#[test]
fn test_ceiling_holds_under_many_writes() {
    let cache = TtlCache::new(Duration::from_secs(60)).with_max_entries(10);
    fill(&cache, "k", 100, Duration::from_secs(60));

    assert_eq!(cache.len(), 10);
    assert_eq!(cache.stats().evictions, 90);
    // Most recent writes survive.
    assert_eq!(cache.get(&"k-99".to_string()), Some(99));
    assert_eq!(cache.get(&"k-0".to_string()), None);
}
