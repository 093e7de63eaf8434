//! L2: SQLite-backed cache of retrieval results
//!
//! Each row holds one entry as a JSON record, keyed by the owning session and
//! the digest of the full cache key. Lookups always filter on both columns.

use super::key::{CacheEntry, CacheKey, Lookup};
use crate::error::{QuarryError, Result};
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::fmt::Display;
use std::path::Path;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

trait CacheIoContext<T> {
    fn cache_context(self, context: &str) -> Result<T>;
}

impl<T, E: Display> CacheIoContext<T> for std::result::Result<T, E> {
    fn cache_context(self, context: &str) -> Result<T> {
        self.map_err(|e| QuarryError::cache_io(context, e))
    }
}

/// Disk cache with migration support
#[derive(Clone)]
pub struct DiskCache {
    pool: DbPool,
    capacity: usize,
}

impl DiskCache {
    /// Open (or create) the cache database at `db_path`
    pub fn open(db_path: &Path, capacity: usize) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QuarryError::Io {
                source: e,
                context: format!("Failed to create cache directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .cache_context("Failed to create connection pool")?;

        let cache = Self {
            pool,
            capacity: capacity.max(1),
        };
        cache.migrate()?;
        Ok(cache)
    }

    fn get_conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().cache_context("Failed to get connection")
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let mut conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )
        .cache_context("Failed to create migrations table")?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying cache migration {}", version);
                // Schema change and its record commit together or not at all
                let tx = conn
                    .transaction()
                    .cache_context("Failed to begin cache migration")?;
                tx.execute_batch(migration)
                    .cache_context("Failed to apply cache migration")?;
                tx.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )
                .cache_context("Failed to record cache migration")?;
                tx.commit()
                    .cache_context("Failed to commit cache migration")?;
            }
        }

        Ok(())
    }

    /// Look up an entry. An expired row is deleted and reported as `Expired`.
    pub(crate) fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Result<Lookup> {
        let conn = self.get_conn()?;
        let digest = key.digest();

        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT record, expires_at FROM cache_entries
                 WHERE session_id = ?1 AND key = ?2",
                params![key.session_id(), digest],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .cache_context("Failed to read cache entry")?;

        let Some((record, expires_at)) = row else {
            return Ok(Lookup::Miss);
        };

        if now.timestamp_millis() >= expires_at {
            conn.execute(
                "DELETE FROM cache_entries WHERE session_id = ?1 AND key = ?2",
                params![key.session_id(), digest],
            )
            .cache_context("Failed to delete expired cache entry")?;
            return Ok(Lookup::Expired);
        }

        let entry: CacheEntry =
            serde_json::from_str(&record).cache_context("Failed to decode cache record")?;
        if &entry.key != key {
            // Digest collision; never hand back someone else's entry
            return Ok(Lookup::Miss);
        }

        conn.execute(
            "UPDATE cache_entries SET last_accessed = ?3 WHERE session_id = ?1 AND key = ?2",
            params![key.session_id(), digest, now.timestamp_millis()],
        )
        .cache_context("Failed to refresh cache entry")?;

        Ok(Lookup::Hit(entry))
    }

    /// Insert or replace an entry, then prune the least recently accessed
    /// rows beyond capacity
    pub fn put(&self, entry: &CacheEntry) -> Result<()> {
        let record = serde_json::to_string(entry).cache_context("Failed to encode cache record")?;
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT OR REPLACE INTO cache_entries
                (session_id, key, record, created_at, expires_at, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.key.session_id(),
                entry.key.digest(),
                record,
                entry.created_at.timestamp_millis(),
                entry.expires_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
            ],
        )
        .cache_context("Failed to write cache entry")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .cache_context("Failed to count cache entries")?;
        let excess = count - self.capacity as i64;
        if excess > 0 {
            let pruned = conn
                .execute(
                    "DELETE FROM cache_entries WHERE rowid IN (
                        SELECT rowid FROM cache_entries
                        ORDER BY last_accessed ASC LIMIT ?1
                    )",
                    params![excess],
                )
                .cache_context("Failed to prune cache")?;
            tracing::debug!(pruned, "pruned L2 cache to capacity");
        }

        Ok(())
    }

    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        let conn = self.get_conn()?;
        let removed = conn
            .execute(
                "DELETE FROM cache_entries WHERE session_id = ?1 AND key = ?2",
                params![key.session_id(), key.digest()],
            )
            .cache_context("Failed to delete cache entry")?;
        Ok(removed > 0)
    }

    /// Delete every row of a session. Returns how many were removed.
    pub fn invalidate_session(&self, session_id: &str) -> Result<usize> {
        let conn = self.get_conn()?;
        conn.execute(
            "DELETE FROM cache_entries WHERE session_id = ?1",
            params![session_id],
        )
        .cache_context("Failed to invalidate session")
    }

    /// Delete every row that expired before `now`
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.get_conn()?;
        conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![now.timestamp_millis()],
        )
        .cache_context("Failed to purge expired entries")
    }

    pub fn clear(&self) -> Result<usize> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM cache_entries", [])
            .cache_context("Failed to clear cache")
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .cache_context("Failed to count cache entries")?;
        Ok(count as usize)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Cache migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    CREATE TABLE cache_entries (
        session_id TEXT NOT NULL,
        key TEXT NOT NULL,
        record TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        last_accessed INTEGER NOT NULL,
        PRIMARY KEY (session_id, key)
    );

    CREATE INDEX idx_cache_entries_expires_at ON cache_entries(expires_at);
    CREATE INDEX idx_cache_entries_last_accessed ON cache_entries(last_accessed);
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{RetrievalMode, RetrievedChunk};
    use std::time::Duration;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn open(temp: &TempDir, capacity: usize) -> DiskCache {
        DiskCache::open(&temp.path().join("cache").join("l2.sqlite"), capacity).unwrap()
    }

    fn entry(session: &str, query: &str, ttl: Duration) -> CacheEntry {
        let results = vec![RetrievedChunk {
            chunk_id: format!("{query}-1"),
            lexical_score: Some(1.5),
            vector_score: None,
            fused_score: 1.5,
            rank: 1,
        }];
        CacheEntry::new(
            CacheKey::new(session, query, RetrievalMode::Bm25, 1),
            results,
            ttl,
        )
    }

    #[test]
    fn test_put_get_roundtrip() {
        let temp = TempDir::new().unwrap();
        let cache = open(&temp, 10);
        let e = entry("s", "cats", HOUR);
        cache.put(&e).unwrap();

        match cache.get(&e.key, Utc::now()).unwrap() {
            Lookup::Hit(hit) => {
                assert_eq!(hit.results, e.results);
                assert_eq!(hit.key, e.key);
            }
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn test_session_isolation() {
        let temp = TempDir::new().unwrap();
        let cache = open(&temp, 10);
        let e = entry("alice", "cats", HOUR);
        cache.put(&e).unwrap();

        let bob = CacheKey::new("bob", "cats", RetrievalMode::Bm25, 1);
        assert!(matches!(cache.get(&bob, Utc::now()).unwrap(), Lookup::Miss));
    }

    #[test]
    fn test_expired_row_is_deleted() {
        let temp = TempDir::new().unwrap();
        let cache = open(&temp, 10);
        let e = entry("s", "cats", Duration::from_secs(1));
        cache.put(&e).unwrap();

        let later = e.expires_at + chrono::Duration::seconds(1);
        assert!(matches!(cache.get(&e.key, later).unwrap(), Lookup::Expired));
        assert_eq!(cache.len().unwrap(), 0);
    }

    #[test]
    fn test_failed_migration_leaves_no_partial_schema() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cache");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("l2.sqlite");

        // An index name the first migration also wants makes it fail halfway
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE other (x INTEGER);
             CREATE INDEX idx_cache_entries_expires_at ON other(x);",
        )
        .unwrap();

        assert!(DiskCache::open(&path, 10).is_err());
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'cache_entries'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);

        // Once the conflict is gone the migration applies cleanly
        conn.execute_batch("DROP INDEX idx_cache_entries_expires_at;")
            .unwrap();
        drop(conn);
        let cache = DiskCache::open(&path, 10).unwrap();
        let e = entry("s", "cats", HOUR);
        cache.put(&e).unwrap();
        assert!(matches!(cache.get(&e.key, Utc::now()).unwrap(), Lookup::Hit(_)));
    }

    #[test]
    fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let e = entry("s", "cats", HOUR);
        open(&temp, 10).put(&e).unwrap();

        let reopened = open(&temp, 10);
        assert!(matches!(
            reopened.get(&e.key, Utc::now()).unwrap(),
            Lookup::Hit(_)
        ));
    }

    #[test]
    fn test_invalidate_session() {
        let temp = TempDir::new().unwrap();
        let cache = open(&temp, 10);
        cache.put(&entry("a", "one", HOUR)).unwrap();
        cache.put(&entry("a", "two", HOUR)).unwrap();
        let keep = entry("b", "one", HOUR);
        cache.put(&keep).unwrap();

        assert_eq!(cache.invalidate_session("a").unwrap(), 2);
        assert_eq!(cache.len().unwrap(), 1);
        assert!(matches!(
            cache.get(&keep.key, Utc::now()).unwrap(),
            Lookup::Hit(_)
        ));
    }

    #[test]
    fn test_purge_expired() {
        let temp = TempDir::new().unwrap();
        let cache = open(&temp, 10);
        cache.put(&entry("s", "old", Duration::ZERO)).unwrap();
        cache.put(&entry("s", "new", HOUR)).unwrap();

        assert_eq!(cache.purge_expired(Utc::now()).unwrap(), 1);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_prunes_least_recently_accessed() {
        let temp = TempDir::new().unwrap();
        let cache = open(&temp, 2);
        let a = entry("s", "a", HOUR);
        let b = entry("s", "b", HOUR);
        cache.put(&a).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.put(&b).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        // Reading a makes b the oldest access
        assert!(matches!(cache.get(&a.key, Utc::now()).unwrap(), Lookup::Hit(_)));
        std::thread::sleep(Duration::from_millis(5));
        cache.put(&entry("s", "c", HOUR)).unwrap();

        assert_eq!(cache.len().unwrap(), 2);
        assert!(matches!(cache.get(&b.key, Utc::now()).unwrap(), Lookup::Miss));
        assert!(matches!(cache.get(&a.key, Utc::now()).unwrap(), Lookup::Hit(_)));
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let cache = open(&temp, 10);
        cache.put(&entry("a", "one", HOUR)).unwrap();
        cache.put(&entry("b", "one", HOUR)).unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.len().unwrap(), 0);
    }
}
