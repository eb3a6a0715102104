//! CDN-bust cache tier.
//!
//! Reads always miss. Writes and expirations enqueue the entry's public URL
//! for invalidation; a background buster periodically flushes the
//! deduplicated queue as one bulk purge call. Failed URLs are re-enqueued.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde_json::json;
use tracing::{debug, warn};

use super::lock::mutex_lock;
use super::{ByteCache, CacheError};

const SOURCE: &str = "cache::cdn";

/// Most URLs accepted by one bulk purge call.
const MAX_URLS_PER_PURGE: usize = 100;
const PURGE_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CdnConfig {
    /// API token with permission to purge.
    pub token: String,
    /// Zone whose cache is purged.
    pub zone_id: String,
    /// Public domain used to reconstruct URLs from cache keys.
    pub domain: String,
}

struct CdnBuster {
    purge_url: String,
    token: String,
    client: reqwest::Client,
    queue: Mutex<HashSet<String>>,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl CdnBuster {
    fn new(config: &CdnConfig) -> Self {
        Self {
            purge_url: format!(
                "https://api.cloudflare.com/client/v4/zones/{}/purge_cache",
                config.zone_id
            ),
            token: config.token.clone(),
            client: reqwest::Client::new(),
            queue: Mutex::new(HashSet::new()),
            limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(1).expect("one is non-zero"),
            )),
        }
    }

    fn add(&self, url: String) {
        mutex_lock(&self.queue, SOURCE, "add").insert(url);
    }

    fn queue_len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "queue_len").len()
    }

    async fn flush(&self) {
        let inflight: Vec<String> = {
            let mut queue = mutex_lock(&self.queue, SOURCE, "flush");
            if queue.is_empty() {
                return;
            }
            let taken: Vec<String> = queue.iter().take(MAX_URLS_PER_PURGE).cloned().collect();
            for url in &taken {
                queue.remove(url);
            }
            taken
        };

        debug!(count = inflight.len(), "busting CDN entries");

        self.limiter.until_ready().await;

        let body = json!({ "files": inflight });
        let result = self
            .client
            .post(&self.purge_url)
            .bearer_auth(&self.token)
            .timeout(PURGE_TIMEOUT)
            .json(&body)
            .send()
            .await;

        let failed = match result {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => {
                warn!(status = %response.status(), "unexpected CDN purge response");
                true
            }
            Err(err) => {
                warn!(error = %err, "problem busting CDN");
                true
            }
        };

        if failed {
            let mut queue = mutex_lock(&self.queue, SOURCE, "requeue");
            for url in inflight {
                queue.insert(url);
            }
        }
    }
}

/// Cache tier that no-ops on reads and turns writes into purge requests.
pub struct CdnCache {
    buster: Arc<CdnBuster>,
    domain: String,
}

impl CdnCache {
    pub fn new(config: CdnConfig) -> Self {
        let buster = Arc::new(CdnBuster::new(&config));

        let flusher = Arc::clone(&buster);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                interval.tick().await;
                flusher.flush().await;
            }
        });

        let stats = Arc::clone(&buster);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                debug!(queue_size = stats.queue_len(), "cdn stats");
            }
        });

        Self {
            buster,
            domain: config.domain,
        }
    }

    /// Map a cache key back to the public URL it is served under.
    fn url_for_key(&self, key: &str) -> String {
        if let Some(id) = key.strip_prefix("ra") {
            return format!("https://{}/author/{id}", self.domain);
        }
        if let Some(id) = key.strip_prefix('b') {
            return format!("https://{}/book/{id}", self.domain);
        }
        if let Some(id) = key.strip_prefix('w') {
            return format!("https://{}/work/{id}", self.domain);
        }
        if let Some(id) = key.strip_prefix('a') {
            return format!("https://{}/author/{id}", self.domain);
        }
        format!("https://{}", self.domain)
    }
}

#[async_trait]
impl ByteCache for CdnCache {
    async fn get_with_ttl(&self, _key: &str) -> Option<(Bytes, Duration)> {
        None
    }

    /// A new value means the CDN's copy is stale, so writes also purge.
    async fn set(&self, key: &str, _value: Bytes, _ttl: Duration) {
        self.buster.add(self.url_for_key(key));
    }

    async fn expire(&self, key: &str) -> Result<(), CacheError> {
        self.buster.add(self.url_for_key(key));
        Ok(())
    }

    /// Delete only happens on refresh sentinels, which the CDN never serves.
    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> CdnCache {
        CdnCache::new(CdnConfig {
            token: "token".to_string(),
            zone_id: "zone".to_string(),
            domain: "books.example.com".to_string(),
        })
    }

    #[tokio::test]
    async fn keys_map_to_public_urls() {
        let cache = cache();
        assert_eq!(
            cache.url_for_key("b42"),
            "https://books.example.com/book/42"
        );
        assert_eq!(
            cache.url_for_key("w42"),
            "https://books.example.com/work/42"
        );
        assert_eq!(
            cache.url_for_key("a42"),
            "https://books.example.com/author/42"
        );
        assert_eq!(
            cache.url_for_key("ra42"),
            "https://books.example.com/author/42"
        );
        assert_eq!(cache.url_for_key("other"), "https://books.example.com");
    }

    #[tokio::test]
    async fn reads_always_miss_and_writes_enqueue() {
        let cache = cache();

        assert!(cache.get("b1").await.is_none());
        assert!(cache.get_with_ttl("b1").await.is_none());

        cache
            .set("b1", Bytes::from_static(b"value"), Duration::from_secs(60))
            .await;
        cache.expire("w2").await.expect("expire enqueues");
        cache.expire("b1").await.expect("duplicate deduped");

        assert_eq!(cache.buster.queue_len(), 2);

        cache.delete("b1").await.expect("delete is a no-op");
        assert_eq!(cache.buster.queue_len(), 2);
    }
}
