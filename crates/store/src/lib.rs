//! Ferry store: bounded id→key cache shared by concurrent reference resolution.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::trace;

struct Inner {
    map: FxHashMap<String, String>,
    order: VecDeque<String>,
    evicted: u64,
}

/// Maps source-project ids to portable keys. Insertion-ordered with a fixed
/// capacity; the oldest entry is evicted first. Blank keys are never stored,
/// so a miss always means "look it up again".
pub struct IdKeyCache {
    inner: Mutex<Inner>,
    cap: usize,
}

impl IdKeyCache {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            inner: Mutex::new(Inner { map: FxHashMap::default(), order: VecDeque::new(), evicted: 0 }),
            cap,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries are independent strings; a panic elsewhere cannot leave one half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize { self.cap }
    pub fn len(&self) -> usize { self.lock().map.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn evicted(&self) -> u64 { self.lock().evicted }

    pub fn get(&self, id: &str) -> Option<String> {
        let hit = self.lock().map.get(id).cloned();
        if hit.is_some() { counter!("cache_hit_total", 1u64); } else { counter!("cache_miss_total", 1u64); }
        hit
    }

    pub fn contains(&self, id: &str) -> bool { self.lock().map.contains_key(id) }

    /// Insert `id → key`. Blank keys are ignored; re-inserting an id keeps its slot.
    /// Returns whether the entry was stored.
    pub fn insert(&self, id: impl Into<String>, key: impl Into<String>) -> bool {
        let key = key.into();
        if key.trim().is_empty() { return false; }
        let id = id.into();
        let mut inner = self.lock();
        if !inner.map.contains_key(&id) {
            if inner.order.len() >= self.cap {
                if let Some(old) = inner.order.pop_front() {
                    inner.map.remove(&old);
                    inner.evicted += 1;
                    counter!("cache_evicted_total", 1u64);
                    trace!(id = %old, "evicted id from key cache");
                }
            }
            inner.order.push_back(id.clone());
        }
        inner.map.insert(id, key);
        true
    }

    /// Insert many pairs; returns how many were stored.
    pub fn extend<I>(&self, pairs: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        pairs.into_iter().filter(|(id, key)| self.insert(id.as_str(), key.as_str())).count()
    }

    /// The subset of `ids` with no cached key, in input order.
    pub fn uncached<'a, I>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let inner = self.lock();
        ids.into_iter().filter(|id| !inner.map.contains_key(id.as_str())).cloned().collect()
    }
}

impl Default for IdKeyCache {
    fn default() -> Self { Self::with_capacity(10_000) }
}
