//! Result cache backing the cached-result fallback
//!
//! Entries expire lazily: an entry older than its TTL is treated as absent
//! when read and is only removed when capacity pressure forces an eviction.

use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;

/// Canonical form of call arguments used as the cache key
///
/// `serde_json` maps are ordered, so equal argument objects always produce the
/// same text. The full text is kept rather than a digest, so distinct arguments
/// never share an entry.
pub fn fingerprint(args: &Value) -> String {
    args.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    operation: String,
    args: String,
}

impl CacheKey {
    fn new(operation: &str, args: &str) -> Self {
        Self {
            operation: operation.to_string(),
            args: args.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedResultEntry {
    result: Value,
    stored_at: Duration,
    ttl: Duration,
}

impl CachedResultEntry {
    fn is_fresh(&self, now: Duration) -> bool {
        now.saturating_sub(self.stored_at) <= self.ttl
    }
}

/// Bounded map of `(operation key, canonical arguments)` to last good result
///
/// Sharded like the operation registry. Concurrent stores into different
/// shards may briefly overshoot `capacity` by the number of racing writers.
#[derive(Debug)]
pub struct FallbackCache {
    entries: DashMap<CacheKey, CachedResultEntry>,
    capacity: usize,
}

impl FallbackCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn store(&self, operation: &str, args: &str, result: Value, ttl: Duration, now: Duration) {
        let key = CacheKey::new(operation, args);

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_one(now);
        }

        self.entries.insert(
            key,
            CachedResultEntry {
                result,
                stored_at: now,
                ttl,
            },
        );
    }

    /// Fresh cached result, if any
    pub fn get(&self, operation: &str, args: &str, now: Duration) -> Option<Value> {
        self.entries
            .get(&CacheKey::new(operation, args))
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.result.clone())
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict an expired entry if there is one, otherwise the oldest
    fn evict_one(&self, now: Duration) {
        // shard guards must be released before `remove`
        let victim = self
            .entries
            .iter()
            .find(|entry| !entry.value().is_fresh(now))
            .map(|entry| entry.key().clone())
            .or_else(|| {
                self.entries
                    .iter()
                    .min_by_key(|entry| entry.value().stored_at)
                    .map(|entry| entry.key().clone())
            });

        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}

impl Default for FallbackCache {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}
