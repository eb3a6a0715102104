//! Persistent cache tier backed by Postgres.
//!
//! One table: `cache(key text primary key, value bytea, expires timestamptz)`
//! with upsert on write. Values are gzip-compressed at rest. Expired rows
//! are kept and returned with a zero TTL so callers can serve stale data
//! while a refresh runs. Scratch buffers are pooled to cap per-call
//! allocation on the hot path.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions};
use time::OffsetDateTime;
use tracing::{error, warn};

use super::lock::mutex_lock;
use super::{ByteCache, CacheError};

const SOURCE: &str = "cache::postgres";
const MAX_POOLED_BUFFERS: usize = 16;

/// Reusable scratch buffers for gzip round trips.
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    const fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<u8> {
        mutex_lock(&self.buffers, SOURCE, "buffer_take")
            .pop()
            .unwrap_or_default()
    }

    fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = mutex_lock(&self.buffers, SOURCE, "buffer_put");
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buffer);
        }
    }
}

static BUFFERS: BufferPool = BufferPool::new();

fn compress(plaintext: &[u8]) -> Result<Vec<u8>, CacheError> {
    let buffer = BUFFERS.take();
    let mut encoder = GzEncoder::new(buffer, Compression::default());
    encoder
        .write_all(plaintext)
        .and_then(|()| encoder.finish())
        .map_err(|err| CacheError::compression(err.to_string()))
}

fn decompress(compressed: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut buffer = BUFFERS.take();
    let mut decoder = GzDecoder::new(compressed);
    match decoder.read_to_end(&mut buffer) {
        Ok(_) => Ok(buffer),
        Err(err) => {
            BUFFERS.put(buffer);
            Err(CacheError::compression(err.to_string()))
        }
    }
}

/// Postgres-backed cache tier.
pub struct PostgresCache {
    pool: PgPool,
}

impl PostgresCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enumerate keys beginning with `prefix`. Used by the persister to find
    /// refreshes that were in flight when the process last shut down.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let pattern = format!("{prefix}%");
        let rows = sqlx::query("SELECT key FROM cache WHERE key LIKE $1")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| CacheError::database(err.to_string()))?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>(0)).collect())
    }
}

#[async_trait]
impl ByteCache for PostgresCache {
    async fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Duration)> {
        let row = sqlx::query("SELECT value, expires FROM cache WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| {
                warn!(key, error = %err, "problem reading cache row");
                err
            })
            .ok()??;

        let compressed: Vec<u8> = row.get(0);
        let expires: OffsetDateTime = row.get(1);

        let plaintext = match decompress(&compressed) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(key, error = %err, "problem decompressing cached value");
                return None;
            }
        };
        let value = Bytes::from(plaintext);

        // Expired rows still return their data, just with no TTL left, so
        // the caller can revalidate while serving something usable.
        let remaining = expires - OffsetDateTime::now_utc();
        let ttl = if remaining.is_positive() {
            Duration::try_from(remaining).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        Some((value, ttl))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        let expires = OffsetDateTime::now_utc() + ttl;

        let compressed = match compress(&value) {
            Ok(compressed) => compressed,
            Err(err) => {
                error!(key, error = %err, "problem compressing value");
                return;
            }
        };

        let result = sqlx::query(
            "INSERT INTO cache (key, value, expires) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires = EXCLUDED.expires",
        )
        .bind(key)
        .bind(&compressed)
        .bind(expires)
        .execute(&self.pool)
        .await;

        BUFFERS.put(compressed);

        if let Err(err) = result {
            error!(key, error = %err, "problem setting cache row");
        }
    }

    async fn expire(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("UPDATE cache SET expires = $1 WHERE key = $2")
            .bind(OffsetDateTime::UNIX_EPOCH)
            .bind(key)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| CacheError::database(err.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM cache WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| CacheError::database(err.to_string()))
    }
}
