//! Claims cache keyed by bearer token
//!
//! Entries are keyed by the SHA-256 digest of the token, so raw tokens never
//! sit in memory longer than the request that carried them. A secondary
//! index maps OIDC session ids to cache keys for back-channel logout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::claims::Claims;

/// Thread-safe claims cache with per-entry expiry.
pub struct ClaimsCache {
    entries: DashMap<String, CachedClaims>,
    sessions: DashMap<String, Vec<String>>,
    max_entries: usize,
    stats: CacheStats,
}

struct CachedClaims {
    claims: Claims,
    expires_at: SystemTime,
    session_id: Option<String>,
}

impl CachedClaims {
    fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }
}

/// Cache statistics tracked atomically.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Entries served from cache.
    pub hits: AtomicU64,
    /// Lookups that found nothing usable.
    pub misses: AtomicU64,
    /// Entries removed by expiry, capacity or logout.
    pub evictions: AtomicU64,
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits.
    pub hits: u64,
    /// Total cache misses.
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Current number of entries.
    pub size: usize,
}

impl ClaimsCache {
    /// Create a cache holding at most `max_entries` tokens.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            sessions: DashMap::new(),
            max_entries: max_entries.max(1),
            stats: CacheStats::default(),
        }
    }

    /// Cached claims for `token`, if present and not expired.
    pub fn get(&self, token: &str) -> Option<Claims> {
        let key = Self::key(token);
        if let Some(entry) = self.entries.get(&key) {
            if entry.is_expired() {
                drop(entry);
                self.remove_key(&key);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.claims.clone())
            }
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Store claims for `token` until `expires_at`, indexed by the claims' `sid`.
    pub fn insert(&self, token: &str, claims: Claims, expires_at: SystemTime) {
        let session_id = claims.session_id().map(str::to_string);
        self.insert_for_session(token, claims, expires_at, session_id);
    }

    /// Store claims for `token`, indexed under an explicit session id. The
    /// token's `sid` may differ from what userinfo returns.
    pub fn insert_for_session(
        &self,
        token: &str,
        claims: Claims,
        expires_at: SystemTime,
        session_id: Option<String>,
    ) {
        if expires_at <= SystemTime::now() {
            return;
        }

        let key = Self::key(token);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }

        let session_id = session_id.filter(|s| !s.is_empty());
        if let Some(sid) = &session_id {
            let mut keys = self.sessions.entry(sid.clone()).or_default();
            if !keys.contains(&key) {
                keys.push(key.clone());
            }
        }

        self.entries.insert(
            key,
            CachedClaims {
                claims,
                expires_at,
                session_id,
            },
        );
    }

    /// Drop every entry belonging to an OIDC session. Returns how many were removed.
    pub fn evict_session(&self, session_id: &str) -> usize {
        let Some((_, keys)) = self.sessions.remove(session_id) else {
            return 0;
        };
        let removed = keys
            .iter()
            .filter(|k| self.entries.remove(*k).is_some())
            .count();
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Evict expired entries and return how many were removed.
    ///
    /// Reads already skip expired entries; this only reclaims memory for
    /// tokens nobody presents again. The server runs it on a timer.
    pub fn evict_expired(&self) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        let count = expired.len();
        for key in expired {
            self.remove_key(&key);
        }
        count
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }

    /// Number of cached tokens.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn make_room(&self) {
        if self.evict_expired() > 0 {
            return;
        }
        let soonest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = soonest {
            self.remove_key(&key);
        }
    }

    fn remove_key(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            if let Some(sid) = entry.session_id {
                self.sessions.remove_if_mut(&sid, |_, keys| {
                    keys.retain(|k| k != key);
                    keys.is_empty()
                });
            }
        }
    }

    fn key(token: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        hex::encode(digest)
    }
}
