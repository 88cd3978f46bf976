//! In-memory caches with TTL and bounded FIFO eviction
//!
//! Provides:
//! - `CacheEntry<T>` freshness tracking
//! - `TtlCache` for schema descriptors (expiry forces a re-fetch)
//! - `BoundedTtlCache` for classification decisions (oldest-first eviction)
//! - Cache key builders
//!
//! Both caches are explicit services injected into their consumers; nothing
//! here is process-global. Population races are benign (worst case is a
//! redundant recompute), so writes are last-writer-wins.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::errors::Result;

/// A cached value with its insertion time and time-to-live.
///
/// Expired entries are dropped on lookup, never refreshed in place; the
/// caller recomputes and re-inserts.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Time-bound cache keyed by string, unbounded in size.
///
/// Used for schema descriptors: a handful of documents, each entry a few
/// hundred bytes, re-fetched from durable storage after the TTL lapses.
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get a fresh value; expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                debug!(key = %key, "Cache hit");
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                debug!(key = %key, "Cache entry expired");
                None
            }
            None => {
                debug!(key = %key, "Cache miss");
                None
            }
        }
    }

    pub fn insert(&self, key: &str, value: V) {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), CacheEntry::new(value, self.ttl));
        debug!(key = %key, ttl_secs = self.ttl.as_secs(), "Cache set");
    }

    /// Get or compute with a loader function. The lock is not held across
    /// the load, so concurrent misses may load redundantly.
    pub async fn get_or_load<F, Fut>(&self, key: &str, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V>>,
    {
        if let Some(cached) = self.get(key) {
            return Ok(cached);
        }

        let value = loader().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

struct BoundedInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    // Insertion order; front is the oldest key. Overwrites keep the
    // original position.
    order: VecDeque<String>,
}

/// Bounded cache with TTL and oldest-first (insertion order) eviction.
///
/// Used for classification decisions: repeated questions skip the
/// language-model call until the entry expires or is evicted.
pub struct BoundedTtlCache<V> {
    inner: RwLock<BoundedInner<V>>,
    capacity: usize,
    ttl: Duration,
}

impl<V: Clone> BoundedTtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(BoundedInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.write();
        match inner.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                debug!(key = %key, "Cache hit");
                Some(entry.value.clone())
            }
            Some(_) => {
                // Leave the stale key in `order`; eviction skips keys that
                // are no longer present.
                inner.entries.remove(key);
                debug!(key = %key, "Cache entry expired");
                None
            }
            None => {
                debug!(key = %key, "Cache miss");
                None
            }
        }
    }

    pub fn insert(&self, key: &str, value: V) {
        let mut inner = self.inner.write();

        let is_new = !inner.entries.contains_key(key);
        if is_new {
            // An expired entry for this key may have left a stale slot in
            // `order`; drop it so the re-insert is ordered as newest.
            inner.order.retain(|k| k != key);
            while inner.entries.len() >= self.capacity {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        if inner.entries.remove(&oldest).is_some() {
                            debug!(key = %oldest, "Cache evicted oldest entry");
                        }
                    }
                    None => break,
                }
            }
            inner.order.push_back(key.to_string());
        }

        inner
            .entries
            .insert(key.to_string(), CacheEntry::new(value, self.ttl));
        debug!(key = %key, "Cache set");
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

/// Cache key builder helpers
pub mod keys {
    use sha2::{Digest, Sha256};
    use uuid::Uuid;

    /// Normalize a question for cache-key purposes only: the processing
    /// pipelines always see the raw input.
    pub fn normalize_question(question: &str) -> String {
        question.trim().to_lowercase()
    }

    /// Hex SHA-256 of the normalized question.
    pub fn question_hash(question: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_question(question).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Build a classification cache key
    pub fn classification(question: &str, document_id: Uuid) -> String {
        format!("classify:{}:{}", document_id, question_hash(question))
    }

    /// Build a schema descriptor cache key
    pub fn schema(document_id: Uuid) -> String {
        format!("schema:{}", document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry() {
        let entry = CacheEntry::new(42u32, Duration::from_millis(10));
        assert!(!entry.is_expired());
        std::thread::sleep(Duration::from_millis(20));
        assert!(entry.is_expired());
    }

    #[test]
    fn test_ttl_cache_expires_and_refetches() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_millis(10));
        cache.insert("k", "v".to_string());
        assert_eq!(cache.get("k"), Some("v".to_string()));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
        // Expired entry must be gone, not refreshed in place.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_bounded_cache_evicts_oldest_first() {
        let cache: BoundedTtlCache<u32> = BoundedTtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_bounded_cache_reinsert_after_expiry_is_newest() {
        let cache: BoundedTtlCache<u32> = BoundedTtlCache::new(2, Duration::from_millis(50));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("a"), None);

        cache.insert("b", 2);
        cache.insert("a", 10);
        cache.insert("c", 3);

        // "b" is the oldest live entry; the re-inserted "a" must not be
        // evicted off its stale slot.
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_bounded_cache_overwrite_keeps_position() {
        let cache: BoundedTtlCache<u32> = BoundedTtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Overwriting "a" must not make it newest.
        cache.insert("a", 10);
        cache.insert("c", 3);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[tokio::test]
    async fn test_get_or_load_loads_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_load("k", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(7u32)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_builders() {
        let doc = uuid::Uuid::new_v4();

        // Key normalization folds case and whitespace.
        assert_eq!(
            keys::classification("  How many matches?  ", doc),
            keys::classification("how many matches?", doc)
        );
        assert_ne!(
            keys::classification("How many matches?", doc),
            keys::classification("How many draws?", doc)
        );
        assert!(keys::schema(doc).starts_with("schema:"));
    }
}
