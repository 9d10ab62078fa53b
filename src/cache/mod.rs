use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    expires_at: Instant,
    last_used: u64,
}

struct CacheState<K, V> {
    map: HashMap<K, Entry<V>>,
    use_counter: u64,
}

/// LRU cache with per-entry TTL. Expired entries are evicted on lookup.
///
/// All operations serialize on one internal mutex; both caches in this
/// service are small enough that contention is a non-issue.
pub struct TtlLruCache<K, V> {
    state: Mutex<CacheState<K, V>>,
    capacity: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlLruCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                map: HashMap::new(),
                use_counter: 0,
            }),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.map.get(key) {
            Some(entry) if now > entry.expires_at => {
                state.map.remove(key);
                None
            }
            Some(_) => {
                state.use_counter += 1;
                let counter = state.use_counter;
                let entry = state.map.get_mut(key).expect("entry checked above");
                entry.last_used = counter;
                Some(entry.value.clone())
            }
            None => None,
        }
    }

    pub fn set(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.use_counter += 1;
        let counter = state.use_counter;
        let expires_at = Instant::now() + self.ttl;

        if !state.map.contains_key(&key) && state.map.len() >= self.capacity {
            // Evict the least recently used entry.
            if let Some(lru_key) = state
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                state.map.remove(&lru_key);
            }
        }

        state.map.insert(
            key,
            Entry {
                value,
                expires_at,
                last_used: counter,
            },
        );
    }

    pub fn clear(&self) {
        self.state.lock().map.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The two service caches: embeddings (keyed by exact input text) and
/// retrieval results (keyed by query string).
pub struct CacheManager {
    embedding_cache: TtlLruCache<String, Vec<f32>>,
    result_cache: TtlLruCache<String, String>,
}

impl CacheManager {
    pub fn new() -> Self {
        Self {
            embedding_cache: TtlLruCache::new(1000, Duration::from_secs(3600)),
            result_cache: TtlLruCache::new(500, Duration::from_secs(300)),
        }
    }

    pub fn get_embedding(&self, text: &str) -> Option<Vec<f32>> {
        self.embedding_cache.get(&text.to_string())
    }

    pub fn set_embedding(&self, text: &str, embedding: Vec<f32>) {
        self.embedding_cache.set(text.to_string(), embedding);
    }

    pub fn get_result(&self, query: &str) -> Option<String> {
        self.result_cache.get(&query.to_string())
    }

    pub fn set_result(&self, query: &str, result: String) {
        self.result_cache.set(query.to_string(), result);
    }

    pub fn clear_all(&self) {
        self.embedding_cache.clear();
        self.result_cache.clear();
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}
