//! Tier composition and percolation.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use super::{ByteCache, CacheError};

const METRIC_CACHE_HITS: &str = "folio_cache_hits_total";
const METRIC_CACHE_MISSES: &str = "folio_cache_misses_total";

/// A tiered key→bytes store consumed in order.
///
/// In practice the tiers are an in-memory LRU backed by Postgres, plus an
/// optional CDN-bust tier. Hits at lower tiers are percolated back up with
/// their remaining TTL so the next read stops earlier.
pub struct LayeredCache {
    tiers: Vec<Arc<dyn ByteCache>>,

    hits: AtomicI64,
    misses: AtomicI64,
}

impl LayeredCache {
    pub fn new(tiers: Vec<Arc<dyn ByteCache>>) -> Self {
        Self {
            tiers,
            hits: AtomicI64::new(0),
            misses: AtomicI64::new(0),
        }
    }

    /// Walk the tiers in order. On the first hit, percolate the value and
    /// its remaining TTL into every earlier tier that missed.
    pub async fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Duration)> {
        for (index, tier) in self.tiers.iter().enumerate() {
            let Some((value, ttl)) = tier.get_with_ttl(key).await else {
                continue;
            };

            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_CACHE_HITS).increment(1);

            // A zero-TTL hit is stale data; writing it upward would just trip
            // the set guard, so only fresh values percolate.
            if ttl > Duration::ZERO && !value.is_empty() {
                for earlier in &self.tiers[..index] {
                    earlier.set(key, value.clone(), ttl).await;
                }
            }

            return Some((value, ttl));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_CACHE_MISSES).increment(1);

        None
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        self.get_with_ttl(key).await.map(|(value, _)| value)
    }

    /// Write to every tier. Empty values and zero TTLs are refused.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        if value.is_empty() {
            warn!(key, "refusing to set empty value");
            return;
        }
        if ttl.is_zero() {
            warn!(key, "refusing to set zero ttl");
            return;
        }

        for tier in &self.tiers {
            tier.set(key, value.clone(), ttl).await;
        }
    }

    /// Zero the entry's TTL on every tier. A subsequent `get_with_ttl` on a
    /// tier that retains data returns `(bytes, 0)` so callers can surface
    /// stale data while revalidating.
    pub async fn expire(&self, key: &str) -> Result<(), CacheError> {
        let mut errors = Vec::new();
        for tier in &self.tiers {
            if let Err(err) = tier.expire(key).await {
                errors.push(err);
            }
        }
        CacheError::join(errors)
    }

    /// Remove the entry from every tier.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut errors = Vec::new();
        for tier in &self.tiers {
            if let Err(err) = tier.delete(key).await {
                errors.push(err);
            }
        }
        CacheError::join(errors)
    }

    /// (hits, misses) since startup.
    pub fn stats(&self) -> (i64, i64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Log hit/miss counters once a minute until the handle is dropped.
    pub fn spawn_stats_logger(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // Skip the first immediate tick.
            loop {
                interval.tick().await;
                let (hits, misses) = cache.stats();
                debug!(
                    hits,
                    misses,
                    ratio = hits as f64 / (hits + misses).max(1) as f64,
                    "cache stats"
                );
            }
        })
    }
}
