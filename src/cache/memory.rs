//! In-memory cache tier.
//!
//! An LRU keyed on cache-key strings where each entry's cost is its byte
//! length. Capacity is half of the process memory budget. Expired entries
//! are dropped on read; stale-while-revalidate is the persistent tier's job.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;

use super::lock::mutex_lock;
use super::{ByteCache, CacheError};

const SOURCE: &str = "cache::memory";

struct MemoryEntry {
    value: Bytes,
    expires_at: Instant,
}

struct MemoryState {
    entries: LruCache<String, MemoryEntry>,
    used_bytes: usize,
    capacity_bytes: usize,
}

impl MemoryState {
    fn evict_over_capacity(&mut self) {
        while self.used_bytes > self.capacity_bytes {
            let Some((_, evicted)) = self.entries.pop_lru() else {
                break;
            };
            self.used_bytes -= evicted.value.len();
        }
    }

    fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.pop(key)?;
        self.used_bytes -= entry.value.len();
        Some(entry)
    }
}

/// Byte-cost-bounded LRU with per-entry TTL.
pub struct MemoryCache {
    state: Mutex<MemoryState>,
}

impl MemoryCache {
    /// Create a memory tier bounded to `capacity_bytes` of cached values.
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                // Bounded by byte cost, not entry count.
                entries: LruCache::unbounded(),
                used_bytes: 0,
                capacity_bytes: capacity_bytes.max(NonZeroUsize::MIN.get()),
            }),
        }
    }

    fn lookup(&self, key: &str, op: &'static str) -> Option<(Bytes, Duration)> {
        let mut state = mutex_lock(&self.state, SOURCE, op);
        let now = Instant::now();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.expires_at <= now,
            None => return None,
        };
        if expired {
            state.remove(key);
            return None;
        }

        let entry = state.entries.get(key)?;
        Some((
            entry.value.clone(),
            entry.expires_at.saturating_duration_since(now),
        ))
    }
}

#[async_trait]
impl ByteCache for MemoryCache {
    async fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Duration)> {
        self.lookup(key, "get_with_ttl")
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        let mut state = mutex_lock(&self.state, SOURCE, "set");
        if value.len() > state.capacity_bytes {
            // An entry larger than the whole tier would evict everything.
            return;
        }
        state.remove(key);
        state.used_bytes += value.len();
        state.entries.put(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        state.evict_over_capacity();
    }

    async fn expire(&self, key: &str) -> Result<(), CacheError> {
        // Memory drops the entry outright; the persistent tier is what keeps
        // expired data around for stale-while-revalidate.
        mutex_lock(&self.state, SOURCE, "expire").remove(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        mutex_lock(&self.state, SOURCE, "delete").remove(key);
        Ok(())
    }
}
