//! Session management
//!
//! A session is the isolation boundary for cached results: every cache key is
//! namespaced by a session id issued here. Sessions expire after a period of
//! inactivity and are swept so their cached data can be dropped.

use crate::error::{QuarryError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A caller context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque, unguessable identifier (UUIDv4)
    pub id: String,

    /// When the session was issued
    pub created_at: DateTime<Utc>,

    /// Last activity
    pub last_seen_at: DateTime<Utc>,
}

impl Session {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_seen_at: now,
        }
    }

    /// Time since the last activity
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_idle_longer_than(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.idle_for(now) > timeout
    }
}

/// Thread-safe session registry using `DashMap` for concurrent access
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Issue a new session and return its id
    pub fn create(&self) -> String {
        let session = Session::new();
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        debug!(session_id = %id, "session created");
        id
    }

    /// Record activity on a session.
    ///
    /// Fails with `SessionNotFound` for an unknown id and `SessionExpired` if
    /// the session went idle past the timeout; an expired session is not
    /// revived.
    pub fn touch(&self, session_id: &str) -> Result<()> {
        let mut session =
            self.sessions
                .get_mut(session_id)
                .ok_or_else(|| QuarryError::SessionNotFound {
                    id: session_id.to_string(),
                })?;

        let now = Utc::now();
        if session.is_idle_longer_than(self.idle_timeout, now) {
            return Err(QuarryError::SessionExpired {
                id: session_id.to_string(),
            });
        }
        session.last_seen_at = now;
        Ok(())
    }

    /// Whether the session has been idle longer than `idle_timeout`.
    /// Unknown ids count as expired.
    pub fn is_expired(&self, session_id: &str, idle_timeout: Duration) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.is_idle_longer_than(idle_timeout, Utc::now()))
            .unwrap_or(true)
    }

    /// Snapshot of a session
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|r| r.clone())
    }

    /// Remove a session. Returns false if it was not registered.
    pub fn end(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Remove every session idle past the registry's timeout and return their ids
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let timeout = self.idle_timeout;
        let mut expired = Vec::new();

        self.sessions.retain(|id, session| {
            if session.is_idle_longer_than(timeout, now) {
                expired.push(id.clone());
                false
            } else {
                true
            }
        });

        if !expired.is_empty() {
            debug!(count = expired.len(), "swept idle sessions");
        }
        expired
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
