//! Layered byte cache.
//!
//! A key→bytes store composed of tiers consumed in order: an in-memory LRU,
//! a persistent Postgres table, and optionally a CDN-bust tier that turns
//! writes into invalidation calls. Hits percolate into earlier tiers.
//! Expired entries are surfaced with a zero TTL where the tier retains data,
//! so callers can serve stale bytes while a refresh runs.

mod cdn;
mod keys;
mod layered;
pub(crate) mod lock;
mod memory;
mod postgres;

pub use cdn::{CdnCache, CdnConfig};
pub use keys::{
    MISSING, REFRESH_AUTHOR_PREFIX, author_key, book_key, is_missing, refresh_author_key, work_key,
};
pub use layered::LayeredCache;
pub use memory::MemoryCache;
pub use postgres::PostgresCache;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("multiple tiers failed: {0}")]
    Joined(String),
}

impl CacheError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    pub fn compression(message: impl Into<String>) -> Self {
        Self::Compression(message.into())
    }

    /// Collapse per-tier failures into one error, or `Ok` if none failed.
    pub fn join(errors: Vec<CacheError>) -> Result<(), CacheError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.into_iter().next().expect("length checked")),
            _ => Err(CacheError::Joined(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )),
        }
    }
}

/// One cache tier. Implementations must be concurrency-safe.
#[async_trait]
pub trait ByteCache: Send + Sync {
    /// Returns the value and its remaining TTL. Tiers that retain expired
    /// data return it with a zero TTL; tiers that drop it return `None`.
    async fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Duration)>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration);

    /// Zero the entry's TTL. Data is retained where the tier persists it.
    async fn expire(&self, key: &str) -> Result<(), CacheError>;

    /// Remove the entry outright.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Option<Bytes> {
        self.get_with_ttl(key).await.map(|(value, _)| value)
    }
}
