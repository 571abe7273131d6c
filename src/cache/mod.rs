use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backend::ResultSet;

/// TTL and size bound for a [`QueryCache`].
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_size: 100,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

/// One cached raw result set with its write timestamp.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    documents: ResultSet,
    timestamp: DateTime<Utc>,
    // Monotone write counter; breaks timestamp ties during eviction.
    sequence: u64,
}

impl CacheEntry {
    pub fn documents(&self) -> &ResultSet {
        &self.documents
    }

    pub fn into_documents(self) -> ResultSet {
        self.documents
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Shared query result cache: cache key to `(raw documents, timestamp)`.
///
/// Entries are informational only. Writes are last-writer-wins; concurrent
/// snapshot arrivals for the same key simply overwrite each other. Raw
/// documents are cached rather than decoded records so every handle for the
/// same logical query shares one entry, whatever its record type or hooks.
pub struct QueryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    sequence: AtomicU64,
    config: CacheConfig,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Returns the entry only if it is younger than `ttl`.
    pub fn get_valid(&self, key: &str, ttl: Duration) -> Option<CacheEntry> {
        self.get(key).filter(|entry| is_fresh(entry, ttl))
    }

    pub fn is_valid(&self, key: &str, ttl: Duration) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|entry| is_fresh(entry, ttl))
            .unwrap_or(false)
    }

    /// Stores `documents` under `key`, stamping the current time, then
    /// enforces the TTL and size bound.
    pub fn set(&self, key: &str, documents: ResultSet) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            CacheEntry {
                documents,
                timestamp: Utc::now(),
                sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            },
        );
        evict_locked(&mut entries, &self.config);
    }

    /// Drops expired entries, then the oldest-written entries until the size
    /// bound holds. Eviction order is write time, not access time.
    pub fn evict(&self) {
        let mut entries = self.entries.lock().unwrap();
        evict_locked(&mut entries, &self.config);
    }

    /// Removes one entry, or every entry when `key` is `None`.
    pub fn clear(&self, key: Option<&str>) {
        let mut entries = self.entries.lock().unwrap();
        match key {
            Some(key) => {
                entries.remove(key);
            }
            None => entries.clear(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

fn is_fresh(entry: &CacheEntry, ttl: Duration) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now() - entry.timestamp < ttl
}

fn evict_locked(entries: &mut HashMap<String, CacheEntry>, config: &CacheConfig) {
    let before = entries.len();
    let ttl = chrono::Duration::from_std(config.ttl).unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();
    entries.retain(|_, entry| now - entry.timestamp < ttl);

    while entries.len() > config.max_size {
        let oldest = entries
            .iter()
            .min_by_key(|(_, entry)| (entry.timestamp, entry.sequence))
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => {
                entries.remove(&key);
            }
            None => break,
        }
    }

    let evicted = before.saturating_sub(entries.len());
    if evicted > 0 {
        log::debug!("evicted {evicted} cache entries ({} remain)", entries.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RawDocument;
    use serde_json::Map;
    use std::thread;

    fn doc(id: &str) -> RawDocument {
        RawDocument::new(id, Map::new())
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = QueryCache::with_defaults();
        cache.set("users|[]", vec![doc("a")]);
        let entry = cache.get("users|[]").expect("entry");
        assert_eq!(entry.documents().len(), 1);
    }

    #[test]
    fn validity_honors_the_ttl() {
        let cache = QueryCache::with_defaults();
        cache.set("k", vec![doc("a")]);
        assert!(cache.is_valid("k", Duration::from_secs(60)));

        thread::sleep(Duration::from_millis(15));
        assert!(!cache.is_valid("k", Duration::from_millis(1)));
        assert!(cache.get_valid("k", Duration::from_millis(1)).is_none());
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn eviction_keeps_the_most_recently_written_entries() {
        let cache = QueryCache::new(CacheConfig::default().with_max_size(3));
        for i in 0..5 {
            cache.set(&format!("key-{i}"), vec![doc("a")]);
        }
        assert_eq!(cache.len(), 3);
        for i in 2..5 {
            assert!(cache.get(&format!("key-{i}")).is_some(), "key-{i} survives");
        }
        for i in 0..2 {
            assert!(cache.get(&format!("key-{i}")).is_none(), "key-{i} evicted");
        }
    }

    #[test]
    fn evict_drops_expired_entries_first() {
        let cache = QueryCache::new(CacheConfig::default().with_ttl(Duration::from_millis(1)));
        cache.set("stale", vec![doc("a")]);
        thread::sleep(Duration::from_millis(10));
        cache.evict();
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_removes_one_or_all() {
        let cache = QueryCache::with_defaults();
        cache.set("a", Vec::new());
        cache.set("b", Vec::new());
        cache.clear(Some("a"));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        cache.clear(None);
        assert!(cache.is_empty());
    }
}
