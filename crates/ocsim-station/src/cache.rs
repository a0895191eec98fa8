//! Process-wide caches for parsed template and configuration documents
//!
//! Stations created from the same template file share one parsed document
//! instead of re-reading it from disk. Entries are keyed by content hash so a
//! changed file naturally misses.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// A bounded least-recently-used cache.
///
/// Lookup order is tracked with a sequence queue; stale queue entries are
/// skipped during eviction, which keeps `get` and `put` O(1) amortized.
#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    use_order: VecDeque<(K, u64)>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU capacity must be non-zero");
        Self {
            capacity,
            entries: HashMap::new(),
            use_order: VecDeque::new(),
            next_seq: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let seq = self.next_seq;
        let (value, entry_seq) = self.entries.get_mut(key)?;
        *entry_seq = seq;
        self.next_seq += 1;
        self.use_order.push_back((key.clone(), seq));
        Some(value.clone())
    }

    pub fn put(&mut self, key: K, value: V) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key.clone(), (value, seq));
        self.use_order.push_back((key, seq));
        self.evict();
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            match self.use_order.pop_front() {
                Some((key, seq)) => {
                    // Only evict when this queue entry is the key's latest use.
                    if self.entries.get(&key).is_some_and(|(_, s)| *s == seq) {
                        self.entries.remove(&key);
                    }
                }
                None => break,
            }
        }
        // Bound the queue against pathological touch patterns.
        if self.use_order.len() > self.capacity * 8 {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.use_order
            .retain(|(key, seq)| entries.get(key).is_some_and(|(_, s)| s == seq));
    }
}

/// Shared cache of parsed JSON documents, keyed by content hash.
#[derive(Debug, Clone)]
pub struct DocumentCache {
    templates: Arc<Mutex<LruCache<String, Arc<Value>>>>,
    configurations: Arc<Mutex<LruCache<String, Arc<Value>>>>,
}

impl DocumentCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            templates: Arc::new(Mutex::new(LruCache::new(capacity))),
            configurations: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn get_template(&self, hash: &str) -> Option<Arc<Value>> {
        self.templates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&hash.to_string())
    }

    pub fn put_template(&self, hash: String, doc: Arc<Value>) {
        self.templates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(hash, doc);
    }

    pub fn get_configuration(&self, hash: &str) -> Option<Arc<Value>> {
        self.configurations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&hash.to_string())
    }

    pub fn put_configuration(&self, hash: String, doc: Arc<Value>) {
        self.configurations
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .put(hash, doc);
    }
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::new(32)
    }
}
