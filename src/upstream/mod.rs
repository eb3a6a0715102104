//! Upstream access: the getter capability set the controller consumes, the
//! batched GraphQL client it is implemented over, and the throttled
//! host-scoped transport underneath.

mod batch;
mod getter;
mod language;
mod transport;

pub use batch::{BatchConfig, BatchedClient};
pub use getter::UpstreamGetter;
pub use language::{iso639_3, release_date};
pub use transport::{Throttle, UpstreamTransport};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::domain::{ProxyError, WorkResource};

/// Sink invoked by a getter when additional editions of the same work are
/// discovered alongside a book. The implementation persists them and emits a
/// single work edge grouping them, without blocking the getter.
pub type EditionsSink = Arc<dyn Fn(Vec<WorkResource>) + Send + Sync>;

/// The capability set the controller consumes. Implementations translate one
/// upstream vocabulary into canonical resources.
///
/// Getters must not write to the cache except to seed newly discovered works
/// and authors they have never seen before.
#[async_trait]
pub trait Getter: Send + Sync {
    /// Returns the serialized work and the ID of its author.
    async fn get_work(
        &self,
        work_id: i64,
        save_editions: Option<EditionsSink>,
    ) -> Result<(Bytes, i64), ProxyError>;

    /// Returns the serialized work envelope holding exactly this book, plus
    /// the work and author IDs it belongs to.
    async fn get_book(
        &self,
        book_id: i64,
        save_editions: Option<EditionsSink>,
    ) -> Result<(Bytes, i64, i64), ProxyError>;

    /// Returns the serialized author.
    async fn get_author(&self, author_id: i64) -> Result<Bytes, ProxyError>;

    /// Lazily enumerates the author's book (edition) IDs.
    async fn author_books(&self, author_id: i64) -> BoxStream<'static, i64>;
}
