use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use cogito_core::Fingerprint;

use crate::clock::{Clock, SystemClock};

pub const DEFAULT_MAX_AGE_SECS: i64 = 60 * 60;
pub const DEFAULT_MAX_ENTRIES: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Entries strictly older than this are treated as absent.
    pub max_age: Duration,
    /// Least recently used entries are dropped beyond this count.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::seconds(DEFAULT_MAX_AGE_SECS),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub item_count: usize,
    /// Expiry window in milliseconds.
    pub max_age: i64,
}

/// Fingerprint-keyed store of validated results with lazy expiry.
///
/// Expired entries are removed when a `get` finds them; there is no
/// background sweep.
pub struct CacheStore<V> {
    entries: LruCache<Fingerprint, CacheEntry<V>>,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> CacheStore<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            max_age: config.max_age,
            clock,
        }
    }

    pub fn get(&mut self, key: &Fingerprint) -> Option<V> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => now - entry.created_at > self.max_age,
        };
        if expired {
            debug!(key = %key, "cache entry expired");
            self.entries.pop(key);
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert or overwrite, stamping the entry with the current time.
    pub fn set(&mut self, key: Fingerprint, value: V) {
        let entry = CacheEntry {
            value,
            created_at: self.clock.now(),
        };
        if let Some((evicted, _)) = self.entries.push(key, entry) {
            debug!(key = %evicted, "cache entry replaced or evicted");
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            item_count: self.len(),
            max_age: self.max_age.num_milliseconds(),
        }
    }
}
