//! Query and suggestion caches.
//!
//! The query cache is keyed by a hash of (query, filters), expires entries
//! after `max_cache_age`, and evicts least-recently-used entries once the
//! estimated footprint passes the configured bound. Any write that touches
//! a message drops every cached result list containing it, which is what
//! keeps the remove-before-next-query invariant cheap to uphold.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::index::SearchHit;

struct CachedQuery {
    hits: Vec<SearchHit>,
    inserted: Instant,
    bytes: usize,
}

pub struct QueryCache {
    entries: HashMap<u64, CachedQuery>,
    /// LRU order, most recent at the back.
    order: VecDeque<u64>,
    ttl: Duration,
    max_bytes: usize,
    current_bytes: usize,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_megabytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            max_bytes: max_megabytes * 1024 * 1024,
            current_bytes: 0,
        }
    }

    fn estimate_bytes(hits: &[SearchHit]) -> usize {
        // Rough: ids dominate; vectors were already dropped from hits.
        64 + hits.iter().map(|h| h.message_id.len() + 48).sum::<usize>()
    }

    pub fn get(&mut self, key: u64) -> Option<Vec<SearchHit>> {
        let expired = match self.entries.get(&key) {
            Some(entry) => entry.inserted.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.remove_entry(key);
            return None;
        }
        self.order.retain(|k| *k != key);
        self.order.push_back(key);
        self.entries.get(&key).map(|e| e.hits.clone())
    }

    pub fn put(&mut self, key: u64, hits: Vec<SearchHit>) {
        self.remove_entry(key);
        let bytes = Self::estimate_bytes(&hits);
        self.entries.insert(key, CachedQuery { hits, inserted: Instant::now(), bytes });
        self.order.push_back(key);
        self.current_bytes += bytes;

        while self.current_bytes > self.max_bytes {
            let Some(oldest) = self.order.front().copied() else { break };
            self.remove_entry(oldest);
        }
    }

    /// Drop every cached result list mentioning `message_id`.
    pub fn invalidate_message(&mut self, message_id: &str) {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.hits.iter().any(|h| h.message_id == message_id))
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            self.remove_entry(key);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.current_bytes = 0;
    }

    fn remove_entry(&mut self, key: u64) {
        if let Some(entry) = self.entries.remove(&key) {
            self.current_bytes = self.current_bytes.saturating_sub(entry.bytes);
        }
        self.order.retain(|k| *k != key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Prefix suggestions from the index vocabulary, bounded and separate from
/// the query cache.
pub struct SuggestionCache {
    entries: HashMap<String, Vec<String>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SuggestionCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new(), capacity }
    }

    pub fn get(&self, prefix: &str) -> Option<&Vec<String>> {
        self.entries.get(prefix)
    }

    pub fn put(&mut self, prefix: String, suggestions: Vec<String>) {
        if self.entries.insert(prefix.clone(), suggestions).is_none() {
            self.order.push_back(prefix);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            self.entries.remove(&oldest);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
