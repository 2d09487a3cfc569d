//! Recently fetched source bytes keyed by normalized source URL
//!
//! Lets differently parameterized requests for one source share a single upstream fetch.

use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Sources {
    lru: LruCache<String, Bytes>,
    bytes: u64,
}

pub struct SourceCache {
    sources: Mutex<Sources>,
    max_bytes: u64,
}

impl SourceCache {
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            sources: Mutex::new(Sources {
                lru: LruCache::new(capacity),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sources> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, url: &str) -> Option<Bytes> {
        self.lock().lru.get(url).cloned()
    }

    /// Sources larger than the whole budget are not kept
    pub fn insert(&self, url: &str, data: Bytes) {
        let size = data.len() as u64;
        if size > self.max_bytes {
            return;
        }

        let mut sources = self.lock();
        if let Some((_, displaced)) = sources.lru.push(url.to_string(), data) {
            sources.bytes -= displaced.len() as u64;
        }
        sources.bytes += size;

        while sources.bytes > self.max_bytes {
            match sources.lru.pop_lru() {
                Some((_, dropped)) => sources.bytes -= dropped.len() as u64,
                None => break,
            }
        }
    }

    pub fn clear(&self) {
        let mut sources = self.lock();
        sources.lru.clear();
        sources.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().bytes
    }
}
