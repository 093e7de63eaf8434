//! Cache keys and entries

use crate::retrieval::{RetrievalMode, RetrievedChunk};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Composite key of a cached retrieval.
///
/// The session id is part of the key itself, so two sessions asking the
/// same question address different entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    session_id: String,
    query: String,
    mode: RetrievalMode,
    k: usize,
}

impl CacheKey {
    pub fn new(session_id: &str, query: &str, mode: RetrievalMode, k: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            query: normalize_query(query),
            mode,
            k,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Normalized query text
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn mode(&self) -> RetrievalMode {
        self.mode
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Stable hex digest of every key component, used as the L2 row key
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [
            self.session_id.as_bytes(),
            self.query.as_bytes(),
            self.mode.as_str().as_bytes(),
        ] {
            // Length prefixes keep ("ab", "c") and ("a", "bc") apart
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.update(&(self.k as u64).to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Trim, lowercase and collapse internal whitespace
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A cached retrieval result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub results: Vec<RetrievedChunk>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, results: Vec<RetrievedChunk>, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            key,
            results,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Outcome of a single-tier lookup
#[derive(Debug)]
pub(crate) enum Lookup {
    Hit(CacheEntry),
    /// Found but past its expiry; the entry has been evicted
    Expired,
    Miss,
}
