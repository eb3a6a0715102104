//! Refresh persistence.
//!
//! An author refresh can take a long time. The pre-refresh snapshot is
//! recorded under a `ra{id}` key so that (a) readers keep seeing the last
//! complete state while the refresh runs, and (b) a restart can resume
//! refreshes that were in flight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::cache::{CacheError, LayeredCache, PostgresCache, REFRESH_AUTHOR_PREFIX, refresh_author_key};
use crate::util::path_to_id;

/// A refresh snapshot survives at most this long. Completion deletes the key
/// eagerly; the TTL only bounds how long a crashed refresh can surface its
/// stale snapshot.
const REFRESH_SNAPSHOT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[async_trait]
pub trait Persister: Send + Sync {
    /// Record an author's refresh as in flight, storing the last complete
    /// snapshot of its bytes.
    async fn persist(&self, author_id: i64, current: Bytes);

    /// Record an in-flight refresh as completed.
    async fn delete(&self, author_id: i64) -> Result<(), CacheError>;

    /// Enumerate all in-flight author refreshes so they can be resumed.
    async fn persisted(&self) -> Result<Vec<i64>, CacheError>;
}

/// Cache-backed persister. Snapshots live in the layered cache under the
/// refresh key; enumeration is a prefix scan of the persistent tier.
pub struct CachePersister {
    cache: Arc<LayeredCache>,
    postgres: Arc<PostgresCache>,
}

impl CachePersister {
    pub fn new(cache: Arc<LayeredCache>, postgres: Arc<PostgresCache>) -> Self {
        Self { cache, postgres }
    }
}

#[async_trait]
impl Persister for CachePersister {
    async fn persist(&self, author_id: i64, current: Bytes) {
        self.cache
            .set(&refresh_author_key(author_id), current, REFRESH_SNAPSHOT_TTL)
            .await;
    }

    async fn delete(&self, author_id: i64) -> Result<(), CacheError> {
        self.cache.delete(&refresh_author_key(author_id)).await
    }

    async fn persisted(&self) -> Result<Vec<i64>, CacheError> {
        let keys = self
            .postgres
            .keys_with_prefix(REFRESH_AUTHOR_PREFIX)
            .await?;

        let mut author_ids = Vec::with_capacity(keys.len());
        for key in keys {
            match path_to_id(&key[REFRESH_AUTHOR_PREFIX.len()..]) {
                Ok(author_id) => author_ids.push(author_id),
                Err(err) => warn!(key = %key, error = %err, "skipping malformed refresh key"),
            }
        }

        Ok(author_ids)
    }
}

/// Persister that records nothing. Used in tests.
pub struct NoPersist;

#[async_trait]
impl Persister for NoPersist {
    async fn persist(&self, _author_id: i64, _current: Bytes) {}

    async fn delete(&self, _author_id: i64) -> Result<(), CacheError> {
        Ok(())
    }

    async fn persisted(&self) -> Result<Vec<i64>, CacheError> {
        Ok(Vec::new())
    }
}
