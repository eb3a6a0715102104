//! Denormalization: propagating child changes upward so the parent's
//! embedded list reflects the latest children.
//!
//! Both routines deserialize the parent exactly once per coalesced edge,
//! binary-search each child into place, repair the sorted/unique invariant,
//! and skip the write entirely when the serialized form is unchanged.

use std::collections::{BTreeMap, HashMap, btree_map::Entry};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use crate::cache::{author_key, book_key, work_key};
use crate::domain::{AuthorResource, ProxyError, SeriesResource, WorkResource};

use super::etag::{EtagWriter, TeeWriter};
use super::ttl;
use super::Inner;

const METRIC_ETAG_MATCHES: &str = "folio_etag_matches_total";
const METRIC_ETAG_MISMATCHES: &str = "folio_etag_mismatches_total";

impl Inner {
    /// Ensure the given editions exist on the work.
    ///
    /// This is what supports translated editions. We intentionally don't
    /// attach every edition in existence: only editions users actually
    /// request flow through here, which keeps the list small enough to pick
    /// a language from.
    pub(crate) async fn denormalize_editions(
        self: &Arc<Self>,
        work_id: i64,
        book_ids: &[i64],
    ) -> Result<(), ProxyError> {
        if book_ids.is_empty() {
            return Ok(());
        }

        let (work_bytes, _) = self.getter().get_work(work_id, None).await.map_err(|err| {
            debug!(work_id, error = %err, "problem getting work");
            err
        })?;

        let old_etag = EtagWriter::digest(&work_bytes);

        let mut work: WorkResource = match serde_json::from_slice(&work_bytes) {
            Ok(work) => work,
            Err(err) => {
                debug!(work_id, error = %err, "problem unmarshaling work");
                let _ = self.cache().expire(&work_key(work_id)).await;
                return Err(ProxyError::from(err));
            }
        };

        debug!(work_id, ?book_ids, "ensuring work-edition edges");

        for &book_id in book_ids {
            let position = work
                .books
                .binary_search_by(|book| book.foreign_id.cmp(&book_id));

            let (envelope_bytes, _, _) = match self.getter().get_book(book_id, None).await {
                Ok(found) => found,
                Err(err) => {
                    // Maybe the entry was deleted out from under us. Move on.
                    warn!(work_id, book_id, error = %err, "unable to denormalize edition");
                    continue;
                }
            };

            let envelope: WorkResource = match serde_json::from_slice(&envelope_bytes) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(book_id, error = %err, "problem unmarshaling book");
                    let _ = self.cache().expire(&book_key(book_id)).await;
                    continue;
                }
            };
            let Some(book) = envelope.books.into_iter().next() else {
                warn!(book_id, "edition envelope had no book");
                continue;
            };

            match position {
                Ok(index) => work.books[index] = book,          // Replace.
                Err(index) => work.books.insert(index, book),   // Insert.
            }
        }

        // Sanity check that the invariant holds: sorted, no dupes.
        work.books.sort_by_key(|book| book.foreign_id);
        let before = work.books.len();
        work.books.dedup_by_key(|book| book.foreign_id);
        if work.books.len() != before {
            warn!(
                work_id,
                compacted = work.books.len(),
                original = before,
                "broken work invariant"
            );
        }

        let mut buffer = Vec::with_capacity(work_bytes.len());
        let mut new_etag = EtagWriter::new();
        serde_json::to_writer(
            TeeWriter {
                buffer: &mut buffer,
                etag: &mut new_etag,
            },
            &work,
        )?;

        if new_etag.etag() == old_etag {
            // The work didn't change, so we're done.
            self.etag_matches.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_ETAG_MATCHES).increment(1);
            return Ok(());
        }
        self.etag_mismatches.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_ETAG_MISMATCHES).increment(1);

        self.cache()
            .set(
                &work_key(work_id),
                Bytes::from(buffer),
                ttl::fuzz(ttl::WORK, ttl::WORK_FUZZ),
            )
            .await;

        // The work changed, so each of its authors needs the update too.
        let author_ids: Vec<i64> = work
            .authors
            .iter()
            .map(|author| author.foreign_id)
            .collect();
        self.queue_author_edges(author_ids, work_id);

        Ok(())
    }

    /// Ensure the given works exist on the author. Invoked in the
    /// background; this is what allows large authors to converge.
    pub(crate) async fn denormalize_works(
        self: &Arc<Self>,
        author_id: i64,
        work_ids: &[i64],
    ) -> Result<(), ProxyError> {
        if work_ids.is_empty() {
            return Ok(());
        }

        let loaded = match self.get_author(author_id).await {
            // Reload once if we hit a cold, rate-limited cache.
            Err(ProxyError::RateLimited) => self.get_author(author_id).await,
            other => other,
        };
        let (author_bytes, _) = loaded.map_err(|err| {
            debug!(author_id, error = %err, "problem loading author for denormalization");
            err
        })?;

        let old_etag = EtagWriter::digest(&author_bytes);

        let mut author: AuthorResource = match serde_json::from_slice(&author_bytes) {
            Ok(author) => author,
            Err(err) => {
                debug!(author_id, error = %err, "problem unmarshaling author");
                let _ = self.cache().expire(&author_key(author_id)).await;
                return Err(ProxyError::from(err));
            }
        };

        debug!(author_id, ?work_ids, "ensuring author-work edges");

        for &work_id in work_ids {
            let position = author
                .works
                .binary_search_by(|work| work.foreign_id.cmp(&work_id));

            let (work_bytes, _) = match self.getter().get_work(work_id, None).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(author_id, work_id, error = %err, "unable to denormalize work");
                    continue;
                }
            };

            let work: WorkResource = match serde_json::from_slice(&work_bytes) {
                Ok(work) => work,
                Err(err) => {
                    warn!(work_id, error = %err, "problem unmarshaling work");
                    let _ = self.cache().expire(&work_key(work_id)).await;
                    continue;
                }
            };

            if work.books.is_empty() {
                warn!(work_id, "work had no editions");
                continue;
            }

            match position {
                Ok(index) => author.works[index] = work,        // Replace.
                Err(index) => author.works.insert(index, work), // Insert.
            }
        }

        // Sanity check that the invariant holds: sorted, no dupes.
        author.works.sort_by_key(|work| work.foreign_id);
        let before = author.works.len();
        author.works.dedup_by_key(|work| work.foreign_id);
        if author.works.len() != before {
            warn!(
                author_id,
                compacted = author.works.len(),
                original = before,
                "broken author invariant"
            );
        }

        recompute_author(&mut author);

        let mut buffer = Vec::with_capacity(author_bytes.len());
        let mut new_etag = EtagWriter::new();
        serde_json::to_writer(
            TeeWriter {
                buffer: &mut buffer,
                etag: &mut new_etag,
            },
            &author,
        )?;

        if new_etag.etag() == old_etag {
            // The author didn't change, so we're done.
            self.etag_matches.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_ETAG_MATCHES).increment(1);
            return Ok(());
        }
        self.etag_mismatches.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_ETAG_MISMATCHES).increment(1);

        self.cache()
            .set(
                &author_key(author_id),
                Bytes::from(buffer),
                ttl::fuzz(ttl::AUTHOR, ttl::AUTHOR_FUZZ),
            )
            .await;

        Ok(())
    }
}

/// Rebuild the author's derived state from its embedded works: the series
/// union, the aggregate rating, and the disambiguated display titles.
fn recompute_author(author: &mut AuthorResource) {
    // Track duplicated titles so they can be disambiguated with subtitles.
    let mut titles: HashMap<String, usize> = HashMap::new();

    // Collect series, merging link items so each series ends up listing
    // every linked work.
    let mut series: BTreeMap<i64, SeriesResource> = BTreeMap::new();

    let mut rating_sum = 0_i64;
    let mut rating_count = 0_i64;

    for work in &author.works {
        let tally = if !work.short_title.is_empty() {
            work.short_title.to_uppercase()
        } else {
            work.title.to_uppercase()
        };
        *titles.entry(tally).or_default() += 1;

        for book in &work.books {
            rating_count += book.rating_count;
            rating_sum += book.rating_sum;
        }

        for entry in &work.series {
            match series.entry(entry.foreign_id) {
                Entry::Occupied(mut existing) => {
                    existing
                        .get_mut()
                        .link_items
                        .extend(entry.link_items.iter().cloned());
                }
                Entry::Vacant(slot) => {
                    slot.insert(entry.clone());
                }
            }
        }
    }

    // Works sharing a short title with another, or belonging to a series,
    // display their full (subtitle-bearing) title instead.
    for work in &mut author.works {
        let short_title = if !work.short_title.is_empty() {
            work.short_title.clone()
        } else {
            work.title.clone()
        };

        let in_series = !work.series.is_empty();
        if !in_series && titles.get(&short_title.to_uppercase()).copied().unwrap_or(0) <= 1 {
            // The short title is already unique; nothing to do.
            continue;
        }
        if work.full_title.is_empty() {
            continue;
        }

        work.title = work.full_title.clone();
        for book in &mut work.books {
            if book.full_title.is_empty() {
                continue;
            }
            book.title = book.full_title.clone();
        }
    }

    author.series = series.into_values().collect();
    author.average_rating = if rating_count != 0 {
        rating_sum as f32 / rating_count as f32
    } else {
        0.0
    };
}
