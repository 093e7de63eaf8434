//! L1: bounded in-memory LRU

use super::key::{CacheEntry, CacheKey, Lookup};
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// In-memory LRU of cache entries.
///
/// The mutex covers only map bookkeeping; callers serialize and
/// deserialize outside it.
pub struct MemoryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an entry, refreshing its LRU position. Expired entries are evicted.
    pub(crate) fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Lookup {
        let mut entries = self.lock();
        match entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) if !entry.is_expired_at(now) => return Lookup::Hit(entry.clone()),
            Some(_) => {}
        }
        entries.pop(key);
        Lookup::Expired
    }

    /// Insert or replace an entry, returning whatever was evicted to make room
    pub fn put(&self, entry: CacheEntry) -> Option<CacheEntry> {
        let key = entry.key.clone();
        match self.lock().push(key.clone(), entry) {
            Some((evicted_key, evicted)) if evicted_key != key => Some(evicted),
            _ => None,
        }
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.lock().pop(key)
    }

    /// Drop every entry of a session. Returns how many were removed.
    pub fn invalidate_session(&self, session_id: &str) -> usize {
        let mut entries = self.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.session_id() == session_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Evict every entry expired at `now`
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }
}
