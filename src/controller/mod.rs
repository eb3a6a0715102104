//! The controller coordinates request-path lookups with background
//! fetch/refresh/denormalization work.
//!
//! The request path is limited to get methods which at worst perform O(1)
//! cache lookups. Expensive work, like denormalizing a large author, happens
//! in the background: the request path emits edges onto a channel, a single
//! consumer drives them through the coalescer, and a bounded refresh pool
//! keeps upstream fan-out in check. Data is cached eagerly when it is first
//! requested, so new works are picked up as soon as they exist upstream.

mod denorm;
mod edges;
mod etag;
mod flight;
mod persist;

pub use edges::{Edge, EdgeCoalescer, EdgeKind};
pub use persist::{CachePersister, NoPersist, Persister};

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::StreamExt;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::cache::{
    LayeredCache, MISSING, author_key, book_key, is_missing, refresh_author_key, work_key,
};
use crate::domain::{AuthorResource, ProxyError, WorkResource};
use crate::upstream::{EditionsSink, Getter};

use flight::{Flight, TtlBytes};

/// Canonical TTLs and the fuzz applied on every store.
pub mod ttl {
    use std::time::Duration;

    pub const AUTHOR: Duration = Duration::from_secs(7 * 24 * 60 * 60);
    pub const WORK: Duration = Duration::from_secs(14 * 24 * 60 * 60);
    pub const EDITION: Duration = Duration::from_secs(28 * 24 * 60 * 60);
    /// How long we wait before retrying a 404.
    pub const MISSING: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    pub const AUTHOR_FUZZ: f64 = 1.5;
    pub const WORK_FUZZ: f64 = 1.5;
    pub const EDITION_FUZZ: f64 = 2.0;

    /// Scale `d` into the range `(d, d * f)` so cached keys don't all come
    /// due at once. Factors below one are treated as `f + 1`.
    pub fn fuzz(d: Duration, f: f64) -> Duration {
        let f = if f < 1.0 { f + 1.0 } else { f };
        let factor = 1.0 + rand::random::<f64>() * (f - 1.0);
        d.mul_f64(factor)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn fuzz_stays_within_bounds() {
            for _ in 0..100 {
                let fuzzed = fuzz(AUTHOR, 2.0);
                assert!(fuzzed >= AUTHOR);
                assert!(fuzzed < AUTHOR * 2);
            }
        }

        #[test]
        fn fractional_factors_gain_one() {
            for _ in 0..100 {
                let fuzzed = fuzz(WORK, 0.5);
                assert!(fuzzed >= WORK);
                assert!(fuzzed < WORK.mul_f64(1.5));
            }
        }
    }
}

/// Every denormalization task runs under this deadline.
const DENORM_TIMEOUT: Duration = Duration::from_secs(60);

/// TTL reported while serving a pre-refresh snapshot.
const REFRESH_SNAPSHOT_REPORTED_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Author IDs that always 404 upstream (reserved anonymous authors).
    /// Never fetched; treated as permanently missing.
    pub unknown_authors: Vec<i64>,
    /// Concurrent background refresh tasks.
    pub refresh_limit: usize,
    /// Most books walked per author refresh.
    pub author_books_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            unknown_authors: vec![22_294_257, 5_158_478],
            refresh_limit: 15,
            author_books_limit: 1000,
        }
    }
}

/// Facade over the shared controller state. Cheap to clone.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    cache: Arc<LayeredCache>,
    getter: Arc<dyn Getter>,
    persister: Arc<dyn Persister>,
    flight: Flight,

    denorm_tx: mpsc::Sender<Edge>,
    denorm_rx: StdMutex<Option<mpsc::Receiver<Edge>>>,

    refresh: Arc<Semaphore>,
    refresh_waiting: AtomicI32,
    denorm_waiting: AtomicI32,

    pub(crate) etag_matches: AtomicI32,
    pub(crate) etag_mismatches: AtomicI32,

    unknown_authors: HashSet<i64>,
    author_books_limit: usize,
}

impl Controller {
    pub fn new(
        cache: Arc<LayeredCache>,
        getter: Arc<dyn Getter>,
        persister: Arc<dyn Persister>,
        config: ControllerConfig,
    ) -> Self {
        // The edge channel is effectively unbuffered: emitters block until
        // the consumer drains, which backpressures the request path's
        // detached tasks rather than the requests themselves.
        let (denorm_tx, denorm_rx) = mpsc::channel(1);

        let inner = Arc::new(Inner {
            cache,
            getter,
            persister,
            flight: Flight::new(),
            denorm_tx,
            denorm_rx: StdMutex::new(Some(denorm_rx)),
            refresh: Arc::new(Semaphore::new(config.refresh_limit.max(1))),
            refresh_waiting: AtomicI32::new(0),
            denorm_waiting: AtomicI32::new(0),
            etag_matches: AtomicI32::new(0),
            etag_mismatches: AtomicI32::new(0),
            unknown_authors: config.unknown_authors.into_iter().collect(),
            author_books_limit: config.author_books_limit,
        });

        // Log controller stats every minute.
        let stats = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let matches = stats.etag_matches.load(Ordering::Relaxed);
                let mismatches = stats.etag_mismatches.load(Ordering::Relaxed);
                debug!(
                    refresh_waiting = stats.refresh_waiting.load(Ordering::Relaxed),
                    denorm_waiting = stats.denorm_waiting.load(Ordering::Relaxed),
                    etag_matches = matches,
                    etag_ratio = matches as f64 / (matches + mismatches).max(1) as f64,
                    "controller stats"
                );
            }
        });

        // Retry any author refreshes that were in flight when the process
        // last shut down.
        let recovery = Arc::clone(&inner);
        tokio::spawn(async move {
            match recovery.persister.persisted().await {
                Err(err) => error!(error = %err, "problem retrying in-flight refreshes"),
                Ok(author_ids) => {
                    for author_id in author_ids {
                        recovery.spawn_refresh_author(author_id, None);
                    }
                }
            }
        });

        Self { inner }
    }

    /// The layered cache behind this controller. The HTTP surface expires
    /// entries through it.
    pub fn cache(&self) -> &Arc<LayeredCache> {
        &self.inner.cache
    }

    /// Load a book (edition) or return the cached value if one exists.
    pub async fn get_book(&self, book_id: i64) -> Result<(Bytes, Duration), ProxyError> {
        self.inner.get_book(book_id).await
    }

    /// Load a work or return the cached value if one exists.
    pub async fn get_work(&self, work_id: i64) -> Result<(Bytes, Duration), ProxyError> {
        self.inner.get_work(work_id).await
    }

    /// Load an author or return the cached value if one exists.
    pub async fn get_author(&self, author_id: i64) -> Result<(Bytes, Duration), ProxyError> {
        self.inner.get_author(author_id).await
    }

    /// Drive the denormalization loop. Edges are coalesced per parent and
    /// applied serially, which is what makes parent writes safe without
    /// per-parent locks. Runs until the consumer task is aborted.
    pub async fn run(&self, wait: Duration) {
        let rx = {
            let mut slot = self
                .inner
                .denorm_rx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        let Some(rx) = rx else {
            error!("denormalization loop is already running");
            return;
        };

        let mut coalescer = EdgeCoalescer::new(rx, wait);
        while let Some(edge) = coalescer.next().await {
            self.inner
                .denorm_waiting
                .fetch_sub(edge.child_ids.len() as i32, Ordering::Relaxed);

            let work = async {
                match edge.kind {
                    EdgeKind::Author => {
                        if self.inner.unknown_authors.contains(&edge.parent_id) {
                            return;
                        }
                        if let Err(err) = self
                            .inner
                            .denormalize_works(edge.parent_id, &edge.child_ids)
                            .await
                        {
                            warn!(
                                author_id = edge.parent_id,
                                work_ids = ?edge.child_ids,
                                error = %err,
                                "problem ensuring work"
                            );
                        }
                    }
                    EdgeKind::Work => {
                        if let Err(err) = self
                            .inner
                            .denormalize_editions(edge.parent_id, &edge.child_ids)
                            .await
                        {
                            warn!(
                                work_id = edge.parent_id,
                                book_ids = ?edge.child_ids,
                                error = %err,
                                "problem ensuring edition"
                            );
                        }
                    }
                }
            };

            if tokio::time::timeout(DENORM_TIMEOUT, work).await.is_err() {
                warn!(
                    parent_id = edge.parent_id,
                    "denormalization timed out"
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Inner {
    pub(crate) async fn get_book(self: &Arc<Self>, book_id: i64) -> Result<TtlBytes, ProxyError> {
        let inner = Arc::clone(self);
        self.flight
            .run(&book_key(book_id), move || {
                async move { inner.get_book_uncoalesced(book_id).await }.boxed()
            })
            .await
    }

    pub(crate) async fn get_work(self: &Arc<Self>, work_id: i64) -> Result<TtlBytes, ProxyError> {
        let inner = Arc::clone(self);
        self.flight
            .run(&work_key(work_id), move || {
                async move { inner.get_work_uncoalesced(work_id).await }.boxed()
            })
            .await
    }

    pub(crate) async fn get_author(
        self: &Arc<Self>,
        author_id: i64,
    ) -> Result<TtlBytes, ProxyError> {
        // The unknown-author IDs are never loadable, so short-circuit
        // without consuming an upstream call.
        if self.unknown_authors.contains(&author_id) {
            return Err(ProxyError::NotFound);
        }
        let inner = Arc::clone(self);
        self.flight
            .run(&author_key(author_id), move || {
                async move { inner.get_author_uncoalesced(author_id).await }.boxed()
            })
            .await
    }

    async fn get_book_uncoalesced(self: Arc<Self>, book_id: i64) -> Result<TtlBytes, ProxyError> {
        if let Some((work_bytes, ttl)) = self.cache.get_with_ttl(&book_key(book_id)).await {
            if ttl > Duration::ZERO {
                if is_missing(&work_bytes) {
                    return Err(ProxyError::NotFound);
                }
                return Ok((work_bytes, ttl));
            }
        }

        // Cache miss.
        let sink = self.editions_sink();
        let (work_bytes, work_id, author_id) =
            match self.getter.get_book(book_id, Some(sink)).await {
                Ok(found) => found,
                Err(ProxyError::NotFound) => {
                    self.cache
                        .set(&book_key(book_id), MISSING.clone(), ttl::MISSING)
                        .await;
                    return Err(ProxyError::NotFound);
                }
                Err(err) => {
                    warn!(book_id, error = %err, "problem getting book");
                    return Err(err);
                }
            };

        let fuzzed = ttl::fuzz(ttl::EDITION, ttl::EDITION_FUZZ);
        self.cache
            .set(&book_key(book_id), work_bytes.clone(), fuzzed)
            .await;

        if work_id > 0 {
            // Ensure the edition is attached to its work, without blocking
            // the response.
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                let _ = inner.get_work(work_id).await; // Ensure fetched.
                let _ = inner.get_author(author_id).await; // Ensure fetched.
                inner.denorm_waiting.fetch_add(1, Ordering::Relaxed);
                let _ = inner.denorm_tx.send(Edge::work(work_id, vec![book_id])).await;
            });
        }

        Ok((work_bytes, fuzzed))
    }

    async fn get_work_uncoalesced(self: Arc<Self>, work_id: i64) -> Result<TtlBytes, ProxyError> {
        let cached = self.cache.get_with_ttl(&work_key(work_id)).await;
        if let Some((cached_bytes, ttl)) = &cached {
            if *ttl > Duration::ZERO {
                if is_missing(cached_bytes) {
                    return Err(ProxyError::NotFound);
                }
                return Ok((cached_bytes.clone(), *ttl));
            }
        }

        let stale_bytes = cached
            .map(|(bytes, _)| bytes)
            .filter(|bytes| !is_missing(bytes));

        // Cache miss.
        let sink = self.editions_sink();
        let (work_bytes, author_id) = match self.getter.get_work(work_id, Some(sink)).await {
            Ok(found) => found,
            Err(ProxyError::NotFound) => {
                self.cache
                    .set(&work_key(work_id), MISSING.clone(), ttl::MISSING)
                    .await;
                return Err(ProxyError::NotFound);
            }
            Err(err) => {
                warn!(work_id, error = %err, "problem getting work");
                return Err(err);
            }
        };

        let fuzzed = ttl::fuzz(ttl::WORK, ttl::WORK_FUZZ);
        self.cache
            .set(&work_key(work_id), work_bytes.clone(), fuzzed)
            .await;

        // Re-fetch whatever editions we already had cached so the refreshed
        // work converges back to its previous breadth. Doesn't block.
        self.spawn_refresh_work(work_id, author_id, stale_bytes.clone());

        // Return the last cached value to give the refresh time to complete.
        if let Some(stale_bytes) = stale_bytes {
            return Ok((stale_bytes, fuzzed));
        }

        Ok((work_bytes, fuzzed))
    }

    /// Returns an author with up to a page of works populated on first load.
    /// Additional works are attached asynchronously; the previous state is
    /// served while a refresh is ongoing.
    async fn get_author_uncoalesced(self: Arc<Self>, author_id: i64) -> Result<TtlBytes, ProxyError> {
        // Prefer a refresh snapshot, if one exists. It holds the author's
        // last complete state prior to refreshing.
        if let Some(pre_refresh) = self.cache.get(&refresh_author_key(author_id)).await {
            if is_missing(&pre_refresh) {
                return Err(ProxyError::NotFound);
            }
            return Ok((pre_refresh, REFRESH_SNAPSHOT_REPORTED_TTL));
        }

        // Not refreshing: the cached value wins while it's valid.
        let cached = self.cache.get_with_ttl(&author_key(author_id)).await;
        if let Some((cached_bytes, ttl)) = &cached {
            if *ttl > Duration::ZERO {
                if is_missing(cached_bytes) {
                    return Err(ProxyError::NotFound);
                }
                return Ok((cached_bytes.clone(), *ttl));
            }
        }

        // Cache miss. Fetch new data.
        let author_bytes = match self.getter.get_author(author_id).await {
            Ok(author_bytes) => author_bytes,
            Err(ProxyError::NotFound) => {
                self.cache
                    .set(&author_key(author_id), MISSING.clone(), ttl::MISSING)
                    .await;
                return Err(ProxyError::NotFound);
            }
            Err(err) => {
                warn!(author_id, error = %err, "problem getting author");
                return Err(err);
            }
        };

        let fuzzed = ttl::fuzz(ttl::AUTHOR, ttl::AUTHOR_FUZZ);
        self.cache
            .set(&author_key(author_id), author_bytes.clone(), fuzzed)
            .await;

        // From here prefer the last-known state. First load has none, so
        // use what was just fetched.
        let previous = cached
            .map(|(bytes, _)| bytes)
            .filter(|bytes| !bytes.is_empty() && !is_missing(bytes))
            .unwrap_or_else(|| author_bytes.clone());

        // Mark the author as being refreshed by recording its last known
        // state, then kick the refresh without blocking the caller.
        self.persister.persist(author_id, previous.clone()).await;
        self.spawn_refresh_author(author_id, Some(previous.clone()));

        Ok((previous, fuzzed))
    }

    /// Sink handed to the getter so it can persist sibling editions it
    /// discovered alongside a best-book fetch. Runs detached.
    fn editions_sink(self: &Arc<Self>) -> EditionsSink {
        let inner = Arc::clone(self);
        Arc::new(move |editions: Vec<WorkResource>| {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                inner.save_editions(editions).await;
            });
        })
    }

    async fn save_editions(self: &Arc<Self>, editions: Vec<WorkResource>) {
        let mut work_id = 0_i64;
        let mut book_ids = Vec::new();

        for envelope in editions {
            if envelope.books.len() != 1 {
                // Every edition arrives as a one-book work envelope.
                warn!(work_id = envelope.foreign_id, "malformed edition");
                continue;
            }
            if work_id == 0 {
                work_id = envelope.foreign_id;
            }
            if envelope.foreign_id != work_id {
                // Editions should all belong to the same work.
                warn!(
                    expected = work_id,
                    got = envelope.foreign_id,
                    "work-edition mismatch"
                );
                continue;
            }
            for author in &envelope.authors {
                let _ = self.get_author(author.foreign_id).await; // Ensure fetched.
            }

            let book_id = envelope.books[0].foreign_id;
            let Ok(out) = serde_json::to_vec(&envelope) else {
                continue;
            };
            self.cache
                .set(
                    &book_key(book_id),
                    Bytes::from(out),
                    ttl::fuzz(ttl::EDITION, ttl::EDITION_FUZZ),
                )
                .await;
            book_ids.push(book_id);
        }

        if work_id == 0 || book_ids.is_empty() {
            return; // Shouldn't happen.
        }

        self.denorm_waiting
            .fetch_add(book_ids.len() as i32, Ordering::Relaxed);
        let _ = self.denorm_tx.send(Edge::work(work_id, book_ids)).await;
    }

    /// Background pass after a work fetch: re-fetch the editions the stale
    /// copy carried, then bind them (and the work's author) back on.
    fn spawn_refresh_work(self: &Arc<Self>, work_id: i64, author_id: i64, stale_bytes: Option<Bytes>) {
        let inner = Arc::clone(self);
        inner.refresh_waiting.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let permit = match Arc::clone(&inner.refresh).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    inner.refresh_waiting.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };

            let stale: WorkResource = stale_bytes
                .as_deref()
                .and_then(|bytes| serde_json::from_slice(bytes).ok())
                .unwrap_or_default();

            let mut book_ids = Vec::with_capacity(stale.books.len());
            for book in &stale.books {
                let _ = inner.get_book(book.foreign_id).await; // Ensure fetched.
                book_ids.push(book.foreign_id);
            }
            let _ = inner.get_author(author_id).await; // Ensure fetched.

            drop(permit); // Free the refresh pool for someone else.
            inner.refresh_waiting.fetch_sub(1, Ordering::Relaxed);

            // Emitting is cheap but can block on the consumer; detach it.
            let emitter = Arc::clone(&inner);
            tokio::spawn(async move {
                emitter
                    .denorm_waiting
                    .fetch_add(book_ids.len() as i32, Ordering::Relaxed);
                let _ = emitter.denorm_tx.send(Edge::work(work_id, book_ids)).await;

                if author_id > 0 {
                    // Ensure the work belongs to its author.
                    emitter.denorm_waiting.fetch_add(1, Ordering::Relaxed);
                    let _ = emitter
                        .denorm_tx
                        .send(Edge::author(author_id, vec![work_id]))
                        .await;
                }
            });
        });
    }

    /// Walk every book the upstream knows for this author, ensure each is
    /// fetched, and emit one consolidated author edge carrying the
    /// deduplicated work IDs. The refresh snapshot is cleared on the way
    /// out, success or not.
    pub(crate) fn spawn_refresh_author(self: &Arc<Self>, author_id: i64, previous: Option<Bytes>) {
        let inner = Arc::clone(self);
        inner.refresh_waiting.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let permit = match Arc::clone(&inner.refresh).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    inner.refresh_waiting.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };

            // Keep whatever works we already had cached.
            let known: AuthorResource = previous
                .as_deref()
                .and_then(|bytes| serde_json::from_slice(bytes).ok())
                .unwrap_or_default();

            let mut work_ids = Vec::with_capacity(known.works.len());
            for work in &known.works {
                let _ = inner.get_work(work.foreign_id).await; // Ensure fetched.
                work_ids.push(work.foreign_id);
            }

            // Then load all of the author's works to make sure we have them.
            info!(author_id, "fetching all works for author");
            let started = std::time::Instant::now();

            let mut books = inner.getter.author_books(author_id).await;
            let mut walked = 0_usize;
            while let Some(book_id) = books.next().await {
                if walked > inner.author_books_limit {
                    break;
                }
                let (book_bytes, _) = match inner.get_book(book_id).await {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(author_id, book_id, error = %err, "problem getting book for author");
                        continue;
                    }
                };
                let envelope: WorkResource =
                    serde_json::from_slice(&book_bytes).unwrap_or_default();
                let work_id = envelope.foreign_id;
                let _ = inner.get_work(work_id).await; // Ensure fetched.
                work_ids.push(work_id);
                walked += 1;
            }

            work_ids.sort_unstable();
            work_ids.dedup();

            if !work_ids.is_empty() {
                // Don't block the refresh pool on the consumer.
                let emitter = Arc::clone(&inner);
                let edge_work_ids = work_ids.clone();
                tokio::spawn(async move {
                    emitter
                        .denorm_waiting
                        .fetch_add(edge_work_ids.len() as i32, Ordering::Relaxed);
                    let _ = emitter
                        .denorm_tx
                        .send(Edge::author(author_id, edge_work_ids))
                        .await;
                });
            }

            info!(
                author_id,
                count = work_ids.len(),
                duration = ?started.elapsed(),
                "fetched all works for author"
            );

            if let Err(err) = inner.persister.delete(author_id).await {
                warn!(author_id, error = %err, "problem un-persisting refresh");
            }
            inner.refresh_waiting.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    pub(crate) fn cache(&self) -> &Arc<LayeredCache> {
        &self.cache
    }

    pub(crate) fn getter(&self) -> &Arc<dyn Getter> {
        &self.getter
    }

    pub(crate) fn queue_author_edges(self: &Arc<Self>, author_ids: Vec<i64>, work_id: i64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            for author_id in author_ids {
                inner.denorm_waiting.fetch_add(1, Ordering::Relaxed);
                let _ = inner
                    .denorm_tx
                    .send(Edge::author(author_id, vec![work_id]))
                    .await;
            }
        });
    }
}
