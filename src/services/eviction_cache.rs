//! Bounded in-memory working set with least-recently-used eviction
//!
//! Entries live in an arena addressed by stable `usize` handles; the recency list stores
//! `prev`/`next` as handles, so there is no shared ownership between the map and the list.
//! One `Mutex` guards the arena, the key map and the byte counter together. Every
//! operation takes it, including lookups, because a lookup reorders the list.
//!
//! Nothing here performs I/O. Operations that displace entries hand them back to the
//! caller, which flushes dirty metadata and deletes backing bytes after the lock is gone.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::CacheEntry;

type Handle = usize;

#[derive(Debug)]
struct Node {
    entry: CacheEntry,
    prev: Option<Handle>,
    next: Option<Handle>,
}

/// Why an entry left the cache as a side effect of `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplaceReason {
    /// Pushed out by capacity or byte-budget pressure
    Evicted,
    /// Larger than the whole byte budget, never admitted
    Rejected,
    /// Overwritten by a newer entry for the same key that points at different bytes
    Replaced,
}

#[derive(Debug, Clone)]
pub struct Displaced {
    pub entry: CacheEntry,
    pub reason: DisplaceReason,
}

impl Displaced {
    /// Whether the index must be told about this entry before it is forgotten
    pub fn needs_flush(&self) -> bool {
        self.reason == DisplaceReason::Evicted && self.entry.dirty
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EvictionStats {
    pub entries: usize,
    pub bytes: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Option<Node>>,
    free: Vec<Handle>,
    index: HashMap<String, Handle>,
    /// Most recently used
    head: Option<Handle>,
    /// Least recently used
    tail: Option<Handle>,
    total_bytes: u64,
    evictions: u64,
}

impl Arena {
    fn node(&self, handle: Handle) -> &Node {
        match self.slots.get(handle) {
            Some(Some(node)) => node,
            _ => unreachable!("dangling cache handle {handle}"),
        }
    }

    fn node_mut(&mut self, handle: Handle) -> &mut Node {
        match self.slots.get_mut(handle) {
            Some(Some(node)) => node,
            _ => unreachable!("dangling cache handle {handle}"),
        }
    }

    fn allocate(&mut self, entry: CacheEntry) -> Handle {
        let node = Node {
            entry,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(handle) => {
                self.slots[handle] = Some(node);
                handle
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, handle: Handle) -> CacheEntry {
        let node = self.slots[handle].take();
        self.free.push(handle);
        match node {
            Some(node) => node.entry,
            None => unreachable!("double release of cache handle {handle}"),
        }
    }

    fn unlink(&mut self, handle: Handle) {
        let (prev, next) = {
            let node = self.node(handle);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(handle);
        node.prev = None;
        node.next = None;
    }

    fn push_front(&mut self, handle: Handle) {
        let old_head = self.head;
        {
            let node = self.node_mut(handle);
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.node_mut(h).prev = Some(handle);
        }
        self.head = Some(handle);
        if self.tail.is_none() {
            self.tail = Some(handle);
        }
    }

    fn move_to_front(&mut self, handle: Handle) {
        if self.head != Some(handle) {
            self.unlink(handle);
            self.push_front(handle);
        }
    }

    fn detach(&mut self, handle: Handle) -> CacheEntry {
        self.unlink(handle);
        let entry = self.release(handle);
        self.index.remove(&entry.key);
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        entry
    }

    fn pop_back(&mut self) -> Option<CacheEntry> {
        let tail = self.tail?;
        Some(self.detach(tail))
    }

    /// Handles from most to least recently used
    fn iter_handles(&self) -> impl Iterator<Item = Handle> + '_ {
        std::iter::successors(self.head, move |&h| self.node(h).next)
    }
}

/// LRU working set bounded by entry count and total bytes
#[derive(Debug)]
pub struct EvictionCache {
    arena: Mutex<Arena>,
    max_entries: usize,
    max_bytes: u64,
}

impl EvictionCache {
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            arena: Mutex::new(Arena::default()),
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        // No operation panics while the arena is half-updated
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `key`, recording the access: moves it to most-recently-used, bumps
    /// `access_count`, refreshes `last_access` and marks it dirty.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let mut arena = self.lock();
        let handle = *arena.index.get(key)?;
        arena.move_to_front(handle);
        let node = arena.node_mut(handle);
        node.entry.touch(now);
        Some(node.entry.clone())
    }

    /// Look up without touching recency or access metadata
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let arena = self.lock();
        let handle = *arena.index.get(key)?;
        Some(arena.node(handle).entry.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().index.contains_key(key)
    }

    /// Insert or update `entry` at the most-recently-used position, then evict from the
    /// least-recently-used end until both limits hold again.
    pub fn put(&self, entry: CacheEntry) -> Vec<Displaced> {
        if entry.size > self.max_bytes {
            // Any resident copy for this key now describes bytes that were overwritten
            let mut arena = self.lock();
            if let Some(handle) = arena.index.get(&entry.key).copied() {
                arena.detach(handle);
            }
            return vec![Displaced {
                entry,
                reason: DisplaceReason::Rejected,
            }];
        }

        let mut displaced = Vec::new();
        let mut arena = self.lock();

        if let Some(&handle) = arena.index.get(&entry.key) {
            let node = arena.node_mut(handle);
            let previous = std::mem::replace(&mut node.entry, entry);
            let new_size = node.entry.size;
            let relocated = previous.locator != node.entry.locator;
            arena.total_bytes = arena.total_bytes.saturating_sub(previous.size) + new_size;
            arena.move_to_front(handle);
            if relocated {
                displaced.push(Displaced {
                    entry: previous,
                    reason: DisplaceReason::Replaced,
                });
            }
        } else {
            let key = entry.key.clone();
            arena.total_bytes += entry.size;
            let handle = arena.allocate(entry);
            arena.index.insert(key, handle);
            arena.push_front(handle);
        }

        while arena.index.len() > self.max_entries || arena.total_bytes > self.max_bytes {
            match arena.pop_back() {
                Some(evicted) => {
                    arena.evictions += 1;
                    displaced.push(Displaced {
                        entry: evicted,
                        reason: DisplaceReason::Evicted,
                    });
                }
                None => break,
            }
        }

        displaced
    }

    /// Remove `key` unconditionally. The caller deletes the returned entry's bytes.
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let mut arena = self.lock();
        let handle = *arena.index.get(key)?;
        Some(arena.detach(handle))
    }

    /// Remove every entry idle since before `cutoff`
    pub fn take_idle_since(&self, cutoff: DateTime<Utc>) -> Vec<CacheEntry> {
        let mut arena = self.lock();
        let stale: Vec<Handle> = arena
            .iter_handles()
            .filter(|&h| arena.node(h).entry.last_access < cutoff)
            .collect();
        stale.into_iter().map(|h| arena.detach(h)).collect()
    }

    /// Point-in-time copy of all entries, most recently used first.
    ///
    /// Entries may be evicted or touched as soon as this returns.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let arena = self.lock();
        arena
            .iter_handles()
            .map(|h| arena.node(h).entry.clone())
            .collect()
    }

    pub fn dirty_snapshot(&self) -> Vec<CacheEntry> {
        let arena = self.lock();
        arena
            .iter_handles()
            .map(|h| &arena.node(h).entry)
            .filter(|e| e.dirty)
            .cloned()
            .collect()
    }

    /// Clear the dirty flag of entries that have not changed since `synced` was taken.
    ///
    /// An entry touched after the snapshot stays dirty so the next sync picks it up.
    pub fn mark_clean(&self, synced: &[CacheEntry]) -> usize {
        let mut arena = self.lock();
        let mut cleaned = 0;
        for written in synced {
            let Some(&handle) = arena.index.get(&written.key) else {
                continue;
            };
            let current = &mut arena.node_mut(handle).entry;
            if current.access_count == written.access_count
                && current.last_access == written.last_access
                && current.locator == written.locator
            {
                current.dirty = false;
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Drop everything, returning the entries so their dirty state can be flushed
    pub fn clear(&self) -> Vec<CacheEntry> {
        let mut arena = self.lock();
        let handles: Vec<Handle> = arena.iter_handles().collect();
        let entries = handles.into_iter().map(|h| arena.release(h)).collect();
        *arena = Arena {
            evictions: arena.evictions,
            ..Arena::default()
        };
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Entry count and byte total read under the same lock acquisition
    pub fn stats(&self) -> EvictionStats {
        let arena = self.lock();
        EvictionStats {
            entries: arena.index.len(),
            bytes: arena.total_bytes,
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            evictions: arena.evictions,
        }
    }
}
