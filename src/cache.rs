use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Default validity window of a cached total.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub size: usize,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: i64,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Read cache of counter totals with a fixed TTL.
///
/// Expiry is lazy: an entry past its deadline is only removed when a lookup
/// touches it. Nothing sweeps the map in the background and there is no
/// capacity bound, so the map holds one entry per distinct key read within
/// the TTL window plus any expired entries not looked up since.
///
/// Time comes from `tokio::time::Instant`, so a paused test runtime controls
/// expiry.
pub struct Cache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl Cache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Get the cached total for `key` if it has not expired.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now = Instant::now();

        let found = self.entries.get(key).map(|entry| *entry);
        match found {
            Some(entry) if entry.is_valid(now) => {
                trace!(key, value = entry.value, "Cache hit");
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            Some(_) => {
                // A concurrent set may have replaced the entry since we looked
                if self
                    .entries
                    .remove_if(key, |_, entry| !entry.is_valid(now))
                    .is_some()
                {
                    self.expired.fetch_add(1, Ordering::Relaxed);
                }
                trace!(key, "Cache miss (expired)");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                trace!(key, "Cache miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or overwrite the total for `key`, valid for one TTL from now.
    pub fn set(&self, key: &str, value: i64) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
        trace!(key, value, ttl_ms = self.ttl.as_millis() as u64, "Cache set");
    }

    /// Drop any entry for `key`, valid or not.
    pub fn invalidate(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            trace!(key, "Cache invalidated");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of stored entries, expired ones not yet reaped included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
