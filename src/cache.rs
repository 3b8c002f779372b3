//! Time- and size-bounded cache of extracted document text keyed by URL.
//!
//! Expired entries are ignored by reads and swept on the next write.  When a
//! write finds the cache full after the sweep, the least recently read
//! entries are evicted first.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
struct CacheEntry {
    content: String,
    created_at: Instant,
    last_accessed_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) < ttl
    }
}

pub struct ContentCache {
    name: &'static str,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ContentCache {
    pub fn new(name: &'static str, ttl: Duration, max_entries: usize) -> Self {
        Self {
            name,
            ttl,
            max_entries,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, Instant::now())
    }

    pub fn set(&self, key: &str, content: String) {
        self.set_at(key, content, Instant::now())
    }

    /// Look up `key` as of `now`, touching its recency on a hit.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<String> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        if !entry.is_fresh(now, self.ttl) {
            return None;
        }
        entry.last_accessed_at = now;
        Some(entry.content.clone())
    }

    /// Insert or overwrite `key` as of `now`.
    pub fn set_at(&self, key: &str, content: String, now: Instant) {
        let mut entries = self.lock();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.is_fresh(now, ttl));

        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            let mut by_recency: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.last_accessed_at))
                .collect();
            by_recency.sort_by_key(|(_, at)| *at);
            let mut evicted = 0usize;
            for (k, _) in by_recency {
                if entries.len() < self.max_entries {
                    break;
                }
                entries.remove(&k);
                evicted += 1;
            }
            tracing::debug!(
                cache = self.name,
                evicted,
                "content cache evicted least recently used entries"
            );
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                content,
                created_at: now,
                last_accessed_at: now,
            },
        );
    }

    /// Number of stored entries, expired ones included until the next write.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[test]
    fn hit_before_ttl_and_miss_after() {
        let cache = ContentCache::new("datasheet", DAY, 10);
        let t0 = Instant::now();
        cache.set_at("https://x/a.pdf", "alpha".into(), t0);
        assert_eq!(cache.get_at("https://x/a.pdf", t0 + DAY / 2).as_deref(), Some("alpha"));
        assert_eq!(cache.get_at("https://x/a.pdf", t0 + DAY), None);
        // Expired entries linger until the next write.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_read_entry() {
        let cache = ContentCache::new("datasheet", DAY, 2);
        let t0 = Instant::now();
        let s = Duration::from_secs(1);
        cache.set_at("A", "a".into(), t0);
        cache.set_at("B", "b".into(), t0 + s);
        assert!(cache.get_at("A", t0 + 2 * s).is_some());
        cache.set_at("C", "c".into(), t0 + 3 * s);
        assert_eq!(cache.len(), 2);
        assert!(cache.get_at("A", t0 + 4 * s).is_some());
        assert!(cache.get_at("B", t0 + 4 * s).is_none());
        assert!(cache.get_at("C", t0 + 4 * s).is_some());
    }

    #[test]
    fn write_sweeps_expired_entries_before_evicting() {
        let cache = ContentCache::new("datasheet", Duration::from_secs(10), 2);
        let t0 = Instant::now();
        cache.set_at("old", "o".into(), t0);
        cache.set_at("recent", "r".into(), t0 + Duration::from_secs(8));
        cache.set_at("new", "n".into(), t0 + Duration::from_secs(12));
        assert_eq!(cache.len(), 2);
        assert!(cache.get_at("recent", t0 + Duration::from_secs(13)).is_some());
    }

    #[test]
    fn overwrite_restarts_ttl() {
        let cache = ContentCache::new("page", Duration::from_secs(10), 4);
        let t0 = Instant::now();
        cache.set_at("k", "v1".into(), t0);
        cache.set_at("k", "v2".into(), t0 + Duration::from_secs(9));
        assert_eq!(cache.get_at("k", t0 + Duration::from_secs(15)).as_deref(), Some("v2"));
    }
}
