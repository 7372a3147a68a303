//! Short-lived response cache keyed by the forwarded path
//!
//! Entries hold the exact bytes sent to the first caller, so every hit within
//! the TTL is byte-identical, `last_updated` stamp included.

use axum::body::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};

/// How long a successful upstream response is served from cache
pub const RESPONSE_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    body: Bytes,
    expires_at: Instant,
}

/// Thread-safe response cache with per-entry TTL expiration
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_at(key, Instant::now())
    }

    /// Look `key` up as of `now`
    ///
    /// An expired entry is dropped and reported as a miss.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<Bytes> {
        if let Some(entry) = self.entries.get(key) {
            if now < entry.expires_at {
                return Some(entry.body.clone());
            }
            drop(entry);
            self.entries.remove_if(key, |_, entry| now >= entry.expires_at);
        }
        None
    }

    pub fn put(&self, key: &str, body: Bytes) {
        self.put_at(key, body, Instant::now());
    }

    pub fn put_at(&self, key: &str, body: Bytes, now: Instant) {
        let entry = CacheEntry {
            body,
            expires_at: now + self.ttl,
        };
        self.entries.insert(key.to_string(), entry);
    }

    /// Drop every entry expired as of `now`, returning how many went
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        before.saturating_sub(self.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(RESPONSE_TTL)
    }
}
