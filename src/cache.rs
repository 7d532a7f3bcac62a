//! Bounded, TTL-based cache of authenticated identities.
//!
//! Keys are `(domain id, credential fingerprint)`, so a password change or
//! a different domain never produces a stale hit. The clock is injectable
//! to make TTL behavior deterministically testable. Entries never outlive
//! one configuration generation: the cache is owned by the pipeline and
//! rebuilt with it.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::trace;

use crate::types::User;

/// Time source for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock-driven default.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cache configuration; any unset duration/size disables that bound.
#[derive(Debug, Clone, Deserialize)]
pub struct UserCacheConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_expire_after_write_seconds")]
    pub expire_after_write_seconds: Option<u64>,
    #[serde(default)]
    pub expire_after_access_seconds: Option<u64>,
    #[serde(default)]
    pub max_size: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

fn default_expire_after_write_seconds() -> Option<u64> {
    Some(3600)
}

impl Default for UserCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_after_write_seconds: default_expire_after_write_seconds(),
            expire_after_access_seconds: None,
            max_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub domain_id: String,
    pub fingerprint: String,
}

struct CacheEntry {
    user: User,
    written_at: Instant,
    last_access: Instant,
}

/// Concurrent user cache. `enabled = false` turns every operation into a
/// no-op, so backends are re-invoked on each request.
pub struct UserCache {
    enabled: bool,
    expire_after_write: Option<Duration>,
    expire_after_access: Option<Duration>,
    max_size: Option<usize>,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    clock: Box<dyn Clock>,
}

impl UserCache {
    pub fn new(config: &UserCacheConfig) -> Self {
        Self::with_clock(config, Box::new(SystemClock))
    }

    pub fn with_clock(config: &UserCacheConfig, clock: Box<dyn Clock>) -> Self {
        Self {
            enabled: config.enabled,
            expire_after_write: config.expire_after_write_seconds.map(Duration::from_secs),
            expire_after_access: config.expire_after_access_seconds.map(Duration::from_secs),
            max_size: config.max_size,
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<User> {
        if !self.enabled {
            return None;
        }

        let now = self.clock.now();
        let mut entries = self.entries.write().ok()?;

        let expired = match entries.get(key) {
            Some(entry) => self.is_expired(entry, now),
            None => return None,
        };

        if expired {
            trace!("Evicting expired user cache entry for domain {}", key.domain_id);
            entries.remove(key);
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.last_access = now;
        Some(entry.user.clone())
    }

    pub fn put(&self, key: CacheKey, user: User) {
        if !self.enabled {
            return;
        }

        let now = self.clock.now();
        let Ok(mut entries) = self.entries.write() else {
            return;
        };

        entries.retain(|_, entry| !self.is_expired(entry, now));

        if let Some(max_size) = self.max_size
            && entries.len() >= max_size
            && !entries.contains_key(&key)
        {
            // Evict the least recently accessed entry to make room.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                user,
                written_at: now,
                last_access: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        if let Some(ttl) = self.expire_after_write
            && now.duration_since(entry.written_at) >= ttl
        {
            return true;
        }

        if let Some(ttl) = self.expire_after_access
            && now.duration_since(entry.last_access) >= ttl
        {
            return true;
        }

        false
    }
}
