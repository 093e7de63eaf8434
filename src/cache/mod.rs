//! Two-tier, session-scoped cache of retrieval results
//!
//! L1 (in-memory LRU) → L2 (SQLite). Writes land in L1 and are mirrored to
//! L2 in the background; L2 hits are promoted back into L1. L2 failures are
//! logged and treated as misses so they never block retrieval.
//!
//! A retrieval takes a [`PutTicket`] before it starts and stores its results
//! with [`MultiTierCache::put_if_current`]. A `clear` or `invalidate_session`
//! that lands in between makes the ticket stale and the results are dropped.

mod disk;
mod key;
mod memory;

pub use disk::DiskCache;
pub use key::{normalize_query, CacheEntry, CacheKey};
pub use memory::MemoryCache;

use crate::config::Config;
use crate::error::{QuarryError, Result};
use crate::retrieval::{RetrievalMode, RetrievedChunk};
use crate::retry::RetryPolicy;
use chrono::Utc;
use key::Lookup;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which tier served a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheHitTier {
    L1,
    L2,
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub l2_errors: u64,
    pub l1_entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    l2_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Invalidation state observed when a retrieval started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutTicket {
    generation: u64,
    session_epoch: u64,
}

/// Bumped by `clear` (generation) and `invalidate_session` (per session)
#[derive(Debug, Default)]
struct Epochs {
    generation: u64,
    sessions: HashMap<String, u64>,
}

impl Epochs {
    fn ticket(&self, session_id: &str) -> PutTicket {
        PutTicket {
            generation: self.generation,
            session_epoch: self.sessions.get(session_id).copied().unwrap_or(0),
        }
    }
}

/// Session-isolated result cache over an L1 LRU and an optional L2 store
pub struct MultiTierCache {
    l1: MemoryCache,
    l2: Option<DiskCache>,
    default_ttl: Duration,
    retry: RetryPolicy,
    mirrors: Mutex<Vec<JoinHandle<()>>>,
    epochs: Mutex<Epochs>,
    counters: Arc<Counters>,
}

impl MultiTierCache {
    pub fn new(
        l1_capacity: NonZeroUsize,
        l2: Option<DiskCache>,
        default_ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            l1: MemoryCache::new(l1_capacity),
            l2,
            default_ttl,
            retry,
            mirrors: Mutex::new(Vec::new()),
            epochs: Mutex::new(Epochs::default()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// L1 only
    pub fn memory_only(l1_capacity: NonZeroUsize, default_ttl: Duration) -> Self {
        Self::new(l1_capacity, None, default_ttl, RetryPolicy::none())
    }

    /// Build from configuration. An L2 store that cannot be opened is logged
    /// and skipped; the cache then runs on L1 alone.
    pub fn from_config(config: &Config) -> Self {
        let l1_capacity = NonZeroUsize::new(config.cache.l1_capacity).unwrap_or(NonZeroUsize::MIN);
        let retry = RetryPolicy::new(
            config.retrieval.retry_attempts,
            Duration::from_millis(config.retrieval.retry_backoff_ms),
        );

        let l2 = if config.cache.l2_enabled {
            let path = config.cache_db_path();
            match DiskCache::open(&path, config.cache.l2_capacity) {
                Ok(disk) => Some(disk),
                Err(e) => {
                    warn!("L2 cache unavailable at {}, using memory only: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        Self::new(l1_capacity, l2, config.cache_ttl(), retry)
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn has_disk_tier(&self) -> bool {
        self.l2.is_some()
    }

    /// Look up a cached retrieval for exactly this session, query, mode and k
    pub async fn get(
        &self,
        session_id: &str,
        query: &str,
        mode: RetrievalMode,
        k: usize,
    ) -> Option<(CacheEntry, CacheHitTier)> {
        self.get_key(&CacheKey::new(session_id, query, mode, k)).await
    }

    pub async fn get_key(&self, key: &CacheKey) -> Option<(CacheEntry, CacheHitTier)> {
        let mut expired = false;

        match self.l1.get(key, Utc::now()) {
            Lookup::Hit(entry) => {
                Counters::bump(&self.counters.l1_hits);
                debug!(tier = "L1", mode = %key.mode(), k = key.k(), "cache hit");
                return Some((entry, CacheHitTier::L1));
            }
            Lookup::Expired => expired = true,
            Lookup::Miss => {}
        }

        if let Some(disk) = &self.l2 {
            let ticket = self.ticket(key.session_id());
            let lookup_key = key.clone();
            let result = run_on_disk(disk.clone(), self.retry, "cache L2 get", move |disk| {
                disk.get(&lookup_key, Utc::now())
            })
            .await;

            match result {
                Ok(Lookup::Hit(entry)) => {
                    let epochs = self.lock_epochs();
                    // Rows read across a clear or invalidation are not served
                    if epochs.ticket(key.session_id()) == ticket {
                        Counters::bump(&self.counters.l2_hits);
                        debug!(tier = "L2", mode = %key.mode(), k = key.k(), "cache hit");
                        self.l1.put(entry.clone());
                        return Some((entry, CacheHitTier::L2));
                    }
                }
                Ok(Lookup::Expired) => expired = true,
                Ok(Lookup::Miss) => {}
                Err(e) => {
                    Counters::bump(&self.counters.l2_errors);
                    warn!("L2 cache read failed, treating as miss: {}", e);
                }
            }
        }

        if expired {
            Counters::bump(&self.counters.expirations);
            debug!(mode = %key.mode(), k = key.k(), "cache entry expired");
        }
        Counters::bump(&self.counters.misses);
        None
    }

    /// Store results in L1 and mirror them to L2 in the background
    pub fn put(
        &self,
        session_id: &str,
        query: &str,
        mode: RetrievalMode,
        k: usize,
        results: Vec<RetrievedChunk>,
        ttl: Duration,
    ) -> CacheEntry {
        let entry = CacheEntry::new(CacheKey::new(session_id, query, mode, k), results, ttl);
        self.put_entry(entry.clone());
        entry
    }

    /// Snapshot the invalidation state for `session_id`
    pub fn ticket(&self, session_id: &str) -> PutTicket {
        self.lock_epochs().ticket(session_id)
    }

    /// Store results only if nothing invalidated them since `ticket` was
    /// taken. Returns `None` when the results were dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn put_if_current(
        &self,
        ticket: PutTicket,
        session_id: &str,
        query: &str,
        mode: RetrievalMode,
        k: usize,
        results: Vec<RetrievedChunk>,
        ttl: Duration,
    ) -> Option<CacheEntry> {
        // Held across the put so a clear or invalidation orders strictly
        // before or after it
        let epochs = self.lock_epochs();
        if epochs.ticket(session_id) != ticket {
            debug!(mode = %mode, k, "cache invalidated during retrieval, not storing");
            return None;
        }

        let entry = CacheEntry::new(CacheKey::new(session_id, query, mode, k), results, ttl);
        self.put_entry(entry.clone());
        Some(entry)
    }

    pub fn put_entry(&self, entry: CacheEntry) {
        self.l1.put(entry.clone());

        let Some(disk) = self.l2.clone() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let retry = self.retry;
                let counters = Arc::clone(&self.counters);
                let mirror = handle.spawn(async move {
                    let result =
                        run_on_disk(disk, retry, "cache L2 put", move |disk| disk.put(&entry)).await;
                    if let Err(e) = result {
                        Counters::bump(&counters.l2_errors);
                        warn!("L2 cache write failed: {}", e);
                    }
                });

                let mut mirrors = self.lock_mirrors();
                mirrors.retain(|m| !m.is_finished());
                mirrors.push(mirror);
            }
            Err(_) => {
                // No runtime to mirror on; write through instead
                if let Err(e) = disk.put(&entry) {
                    Counters::bump(&self.counters.l2_errors);
                    warn!("L2 cache write failed: {}", e);
                }
            }
        }
    }

    fn lock_mirrors(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.mirrors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_epochs(&self) -> MutexGuard<'_, Epochs> {
        self.epochs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for every in-flight L2 mirror write
    pub async fn flush(&self) {
        let mirrors = std::mem::take(&mut *self.lock_mirrors());
        for mirror in mirrors {
            if let Err(e) = mirror.await {
                warn!("L2 mirror task failed: {}", e);
            }
        }
    }

    /// Remove every entry of a session from both tiers.
    ///
    /// Pending mirror writes are flushed first so none can land after the
    /// delete. Unlike reads, a failed L2 delete is reported to the caller.
    pub async fn invalidate_session(&self, session_id: &str) -> Result<()> {
        {
            let mut epochs = self.lock_epochs();
            *epochs.sessions.entry(session_id.to_string()).or_insert(0) += 1;
        }
        self.flush().await;
        let l1_removed = self.l1.invalidate_session(session_id);

        let l2_removed = match &self.l2 {
            Some(disk) => {
                let id = session_id.to_string();
                run_on_disk(disk.clone(), self.retry, "cache L2 invalidate", move |disk| {
                    disk.invalidate_session(&id)
                })
                .await?
            }
            None => 0,
        };

        debug!(l1_removed, l2_removed, "invalidated session cache");
        Ok(())
    }

    /// Drop every entry in both tiers
    pub async fn clear(&self) {
        {
            // A new generation outdates every ticket, so the per-session
            // epochs can start over
            let mut epochs = self.lock_epochs();
            epochs.generation += 1;
            epochs.sessions.clear();
        }
        self.flush().await;
        self.l1.clear();

        if let Some(disk) = &self.l2 {
            let result =
                run_on_disk(disk.clone(), self.retry, "cache L2 clear", |disk| disk.clear()).await;
            if let Err(e) = result {
                Counters::bump(&self.counters.l2_errors);
                warn!("L2 cache clear failed: {}", e);
            }
        }
    }

    /// Evict expired entries from both tiers. Returns the number of L1
    /// entries and L2 rows removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut purged = self.l1.purge_expired(now);

        if let Some(disk) = &self.l2 {
            match run_on_disk(disk.clone(), self.retry, "cache L2 purge", move |disk| {
                disk.purge_expired(now)
            })
            .await
            {
                Ok(rows) => purged += rows,
                Err(e) => {
                    Counters::bump(&self.counters.l2_errors);
                    warn!("L2 cache purge failed: {}", e);
                }
            }
        }

        purged
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            l1_hits: c.l1_hits.load(Ordering::Relaxed),
            l2_hits: c.l2_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            l2_errors: c.l2_errors.load(Ordering::Relaxed),
            l1_entries: self.l1.len(),
        }
    }
}

/// Run a blocking L2 operation off the async workers, with retry
async fn run_on_disk<T, F>(disk: DiskCache, retry: RetryPolicy, name: &str, op: F) -> Result<T>
where
    T: Send + 'static,
    F: Fn(&DiskCache) -> Result<T> + Clone + Send + Sync + 'static,
{
    retry
        .run(name, || {
            let disk = disk.clone();
            let op = op.clone();
            async move {
                tokio::task::spawn_blocking(move || op(&disk))
                    .await
                    .map_err(|e| QuarryError::cache_io("L2 task failed", e))?
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn chunk(id: &str, rank: usize) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: id.to_string(),
            lexical_score: Some(1.0),
            vector_score: None,
            fused_score: 1.0,
            rank,
        }
    }

    fn two_tier(temp: &TempDir, l1_capacity: usize) -> MultiTierCache {
        let disk = DiskCache::open(&temp.path().join("l2.sqlite"), 100).unwrap();
        MultiTierCache::new(
            NonZeroUsize::new(l1_capacity).unwrap(),
            Some(disk),
            HOUR,
            RetryPolicy::new(1, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_l1_hit() {
        let cache = MultiTierCache::memory_only(NonZeroUsize::new(8).unwrap(), HOUR);
        cache.put("s", "cats", RetrievalMode::Bm25, 2, vec![chunk("c", 1)], HOUR);

        let (entry, tier) = cache.get("s", "  CATS ", RetrievalMode::Bm25, 2).await.unwrap();
        assert_eq!(tier, CacheHitTier::L1);
        assert_eq!(entry.results[0].chunk_id, "c");
        assert_eq!(cache.stats().l1_hits, 1);
    }

    #[tokio::test]
    async fn test_mode_and_k_do_not_collide() {
        let cache = MultiTierCache::memory_only(NonZeroUsize::new(8).unwrap(), HOUR);
        cache.put("s", "cats", RetrievalMode::Bm25, 2, vec![chunk("c", 1)], HOUR);

        assert!(cache.get("s", "cats", RetrievalMode::Hybrid, 2).await.is_none());
        assert!(cache.get("s", "cats", RetrievalMode::Bm25, 3).await.is_none());
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_to_l1() {
        let temp = TempDir::new().unwrap();
        let cache = two_tier(&temp, 1);
        cache.put("s", "first", RetrievalMode::Hybrid, 1, vec![chunk("a", 1)], HOUR);
        cache.put("s", "second", RetrievalMode::Hybrid, 1, vec![chunk("b", 1)], HOUR);
        cache.flush().await;

        // "first" was pushed out of the single-slot L1 but lives on in L2
        let (entry, tier) = cache.get("s", "first", RetrievalMode::Hybrid, 1).await.unwrap();
        assert_eq!(tier, CacheHitTier::L2);
        assert_eq!(entry.results[0].chunk_id, "a");

        let (_, tier) = cache.get("s", "first", RetrievalMode::Hybrid, 1).await.unwrap();
        assert_eq!(tier, CacheHitTier::L1);
    }

    #[tokio::test]
    async fn test_sessions_never_share_entries() {
        let temp = TempDir::new().unwrap();
        let cache = two_tier(&temp, 8);
        cache.put("alice", "secret", RetrievalMode::Hybrid, 5, vec![chunk("x", 1)], HOUR);
        cache.flush().await;

        assert!(cache.get("bob", "secret", RetrievalMode::Hybrid, 5).await.is_none());
        assert!(cache.get("alice", "secret", RetrievalMode::Hybrid, 5).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_session_clears_both_tiers() {
        let temp = TempDir::new().unwrap();
        let cache = two_tier(&temp, 8);
        cache.put("s", "q", RetrievalMode::Bm25, 1, vec![chunk("a", 1)], HOUR);
        cache.put("other", "q", RetrievalMode::Bm25, 1, vec![chunk("a", 1)], HOUR);

        // No flush: invalidation must wait for the pending mirror itself
        cache.invalidate_session("s").await.unwrap();

        assert!(cache.get("s", "q", RetrievalMode::Bm25, 1).await.is_none());
        assert!(cache.get("other", "q", RetrievalMode::Bm25, 1).await.is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let cache = two_tier(&temp, 8);
        cache.put("s", "q", RetrievalMode::Bm25, 1, vec![chunk("a", 1)], Duration::ZERO);
        cache.flush().await;

        assert!(cache.get("s", "q", RetrievalMode::Bm25, 1).await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_clear_and_purge() {
        let temp = TempDir::new().unwrap();
        let cache = two_tier(&temp, 8);
        cache.put("s", "old", RetrievalMode::Bm25, 1, Vec::new(), Duration::ZERO);
        cache.put("s", "new", RetrievalMode::Bm25, 1, Vec::new(), HOUR);
        cache.flush().await;

        // One expired entry in each tier
        assert_eq!(cache.purge_expired().await, 2);
        assert!(cache.get("s", "new", RetrievalMode::Bm25, 1).await.is_some());

        cache.clear().await;
        assert!(cache.get("s", "new", RetrievalMode::Bm25, 1).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_outdates_earlier_tickets() {
        let temp = TempDir::new().unwrap();
        let cache = two_tier(&temp, 8);
        let ticket = cache.ticket("s");

        cache.clear().await;
        let stored =
            cache.put_if_current(ticket, "s", "q", RetrievalMode::Bm25, 1, vec![chunk("a", 1)], HOUR);
        assert!(stored.is_none());
        cache.flush().await;
        assert!(cache.get("s", "q", RetrievalMode::Bm25, 1).await.is_none());

        // A ticket taken after the clear is honoured
        let ticket = cache.ticket("s");
        let stored =
            cache.put_if_current(ticket, "s", "q", RetrievalMode::Bm25, 1, vec![chunk("a", 1)], HOUR);
        assert!(stored.is_some());
        assert!(cache.get("s", "q", RetrievalMode::Bm25, 1).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidation_outdates_only_that_session() {
        let temp = TempDir::new().unwrap();
        let cache = two_tier(&temp, 8);
        let ended = cache.ticket("ended");
        let other = cache.ticket("other");

        cache.invalidate_session("ended").await.unwrap();

        assert!(cache
            .put_if_current(ended, "ended", "q", RetrievalMode::Hybrid, 3, vec![chunk("a", 1)], HOUR)
            .is_none());
        assert!(cache
            .put_if_current(other, "other", "q", RetrievalMode::Hybrid, 3, vec![chunk("a", 1)], HOUR)
            .is_some());
        cache.flush().await;

        // Nothing reached either tier for the invalidated session
        assert!(cache.get("ended", "q", RetrievalMode::Hybrid, 3).await.is_none());
        let disk = DiskCache::open(&temp.path().join("l2.sqlite"), 100).unwrap();
        assert_eq!(disk.len().unwrap(), 1);
    }

    #[test]
    fn test_put_without_runtime_writes_through() {
        let temp = TempDir::new().unwrap();
        let cache = two_tier(&temp, 1);
        cache.put("s", "a", RetrievalMode::Bm25, 1, vec![chunk("a", 1)], HOUR);

        let disk = DiskCache::open(&temp.path().join("l2.sqlite"), 100).unwrap();
        assert_eq!(disk.len().unwrap(), 1);
    }
}
