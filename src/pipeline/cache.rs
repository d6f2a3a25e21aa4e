//! Translation cache
//!
//! Bounded LRU keyed on the normalized source text and the language pair,
//! with a TTL so stale machine translations age out. Process-local and not
//! required for correctness; a miss simply calls the MT port.

use lru::LruCache;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Stable key: hash of (normalized text, src, tgt)
fn cache_key(text: &str, source: &str, target: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    normalize(text).hash(&mut hasher);
    source.hash(&mut hasher);
    target.hash(&mut hasher);
    hasher.finish()
}

/// Lowercase and collapse whitespace so trivial variations share an entry
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

struct Entry {
    translated: String,
    inserted_at: Instant,
}

/// LRU of translated text with per-entry TTL
pub struct TranslationCache {
    entries: Mutex<LruCache<u64, Entry>>,
    ttl: Duration,
}

impl TranslationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn get(&self, text: &str, source: &str, target: &str) -> Option<String> {
        let key = cache_key(text, source, target);
        let mut entries = self.entries.lock().unwrap();
        let expired = match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Some(entry.translated.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(&key);
        }
        None
    }

    pub fn insert(&self, text: &str, source: &str, target: &str, translated: String) {
        let key = cache_key(text, source, target);
        self.entries.lock().unwrap().put(
            key,
            Entry {
                translated,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
