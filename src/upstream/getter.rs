//! Concrete getter speaking the upstream's GraphQL vocabulary.
//!
//! The upstream is normalized and edition-centric: a "book" lookup returns
//! one edition plus its work and contributors, and author pages are walked
//! via works-by-contributor pagination keyed on the upstream-canonical KCA
//! rather than the legacy numeric ID. This getter translates those records
//! into the canonical resources the controller caches.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::{LayeredCache, author_key, book_key, work_key};
use crate::controller::ttl;
use crate::domain::{
    AuthorResource, BookResource, ContributorResource, ProxyError, SeriesResource,
    SeriesWorkLinkResource, WorkResource,
};
use crate::upstream::{BatchedClient, EditionsSink, Getter, UpstreamTransport, iso639_3, release_date};
use crate::util::path_to_id;

const GET_BOOK_QUERY: &str = r#"
query GetBookByLegacyId($legacyId: Int!) {
  bookByLegacyId(legacyId: $legacyId) {
    ...EditionInfo
    work {
      id
      legacyId
      details { webUrl publicationTime }
      bestBook { legacyId title titlePrimary }
      editions { edges { node { ...EditionInfo } } }
    }
  }
}
fragment EditionInfo on Book {
  id
  legacyId
  title
  titlePrimary
  description
  webUrl
  imageUrl
  bookGenres { genre { name } }
  bookSeries { seriesPlacement series { id title webUrl } }
  details {
    asin
    isbn13
    format
    numPages
    publisher
    publicationTime
    language { name }
  }
  stats { ratingsCount ratingsSum averageRating }
  primaryContributorEdge {
    role
    node { id legacyId name description webUrl profileImageUrl }
  }
}
"#;

const GET_AUTHOR_QUERY: &str = r#"
query GetAuthorByLegacyId($legacyId: Int!) {
  authorByLegacyId(legacyId: $legacyId) { id name }
}
"#;

const GET_AUTHOR_WORKS_QUERY: &str = r#"
query GetAuthorWorks($id: String!, $limit: Int!, $after: String) {
  worksByContributor(id: $id, limit: $limit, after: $after) {
    pageInfo { hasNextPage nextPageToken }
    edges {
      node {
        bestBook {
          legacyId
          primaryContributorEdge { role node { legacyId } }
        }
      }
    }
  }
}
"#;

/// Page size for author work enumeration. The initial author load uses one
/// page; the background refresh walks the cursor to the end.
const AUTHOR_WORKS_PAGE: i64 = 20;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EditionDto {
    id: String,
    legacy_id: i64,
    title: String,
    title_primary: String,
    description: String,
    web_url: String,
    image_url: String,
    book_genres: Vec<GenreEdgeDto>,
    book_series: Vec<BookSeriesDto>,
    details: DetailsDto,
    stats: StatsDto,
    primary_contributor_edge: ContributorEdgeDto,
    work: Option<WorkDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GenreEdgeDto {
    genre: GenreDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GenreDto {
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BookSeriesDto {
    series_placement: String,
    series: SeriesDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SeriesDto {
    id: String,
    title: String,
    web_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DetailsDto {
    asin: String,
    isbn13: String,
    format: String,
    num_pages: i64,
    publisher: String,
    publication_time: i64,
    language: LanguageDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LanguageDto {
    name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StatsDto {
    ratings_count: i64,
    ratings_sum: i64,
    average_rating: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ContributorEdgeDto {
    role: String,
    node: AuthorNodeDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AuthorNodeDto {
    id: String,
    legacy_id: i64,
    name: String,
    description: String,
    web_url: String,
    profile_image_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkDto {
    id: String,
    legacy_id: i64,
    details: WorkDetailsDto,
    best_book: BestBookDto,
    editions: EditionsDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkDetailsDto {
    web_url: String,
    publication_time: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BestBookDto {
    legacy_id: i64,
    title: String,
    title_primary: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EditionsDto {
    edges: Vec<EditionEdgeDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EditionEdgeDto {
    node: EditionDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AuthorRefDto {
    id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorksPageDto {
    page_info: PageInfoDto,
    edges: Vec<WorkEdgeDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PageInfoDto {
    has_next_page: bool,
    next_page_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WorkEdgeDto {
    node: WorkNodeDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WorkNodeDto {
    best_book: BestBookRefDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BestBookRefDto {
    legacy_id: i64,
    primary_contributor_edge: ContributorRefDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ContributorRefDto {
    role: String,
    node: LegacyIdDto,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LegacyIdDto {
    legacy_id: i64,
}

/// How sibling editions are deduplicated before being offered to the
/// controller: one edition per distinct title/language, with audio formats
/// kept separately.
#[derive(Debug, PartialEq, Eq, Hash)]
struct EditionDedupe {
    title: String,
    language: String,
    audio: bool,
}

/// Getter backed by the upstream's GraphQL API.
pub struct UpstreamGetter {
    cache: Arc<LayeredCache>,
    gql: Arc<BatchedClient>,
    transport: Arc<UpstreamTransport>,
}

impl UpstreamGetter {
    pub fn new(
        cache: Arc<LayeredCache>,
        gql: Arc<BatchedClient>,
        transport: Arc<UpstreamTransport>,
    ) -> Self {
        Self {
            cache,
            gql,
            transport,
        }
    }

    async fn fetch_edition(&self, book_id: i64) -> Result<EditionDto, ProxyError> {
        let response = self
            .gql
            .make_request(GET_BOOK_QUERY, json!({ "legacyId": book_id }))
            .await?;

        let data = response
            .get("bookByLegacyId")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if data.is_null() {
            return Err(ProxyError::NotFound);
        }

        serde_json::from_value(data).map_err(ProxyError::from)
    }

    /// Resolve a legacy author ID to its KCA, preferring whatever our cached
    /// author already recorded.
    async fn resolve_author_kca(&self, author_id: i64) -> Result<String, ProxyError> {
        if let Some(author_bytes) = self.cache.get(&author_key(author_id)).await {
            if let Ok(author) = serde_json::from_slice::<AuthorResource>(&author_bytes) {
                if !author.kca.is_empty() {
                    debug!(author_id, kca = %author.kca, "found cached author KCA");
                    return Ok(author.kca);
                }
            }
        }

        debug!(author_id, "resolving author KCA");
        let response = self
            .gql
            .make_request(GET_AUTHOR_QUERY, json!({ "legacyId": author_id }))
            .await?;

        let data = response
            .get("authorByLegacyId")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if data.is_null() {
            return Err(ProxyError::NotFound);
        }

        let author: AuthorRefDto = serde_json::from_value(data)?;
        if author.id.is_empty() {
            return Err(ProxyError::NotFound);
        }
        Ok(author.id)
    }

    async fn works_page(
        &self,
        kca: &str,
        after: Option<&str>,
    ) -> Result<WorksPageDto, ProxyError> {
        let response = self
            .gql
            .make_request(
                GET_AUTHOR_WORKS_QUERY,
                json!({ "id": kca, "limit": AUTHOR_WORKS_PAGE, "after": after }),
            )
            .await?;

        let data = response
            .get("worksByContributor")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if data.is_null() {
            return Err(ProxyError::NotFound);
        }

        serde_json::from_value(data).map_err(ProxyError::from)
    }

    /// Seed cache entries for a freshly mapped work, and offer its sibling
    /// editions to the controller. These are the only writes a getter makes.
    async fn seed(
        &self,
        book_id: i64,
        edition: &EditionDto,
        work_rsc: &WorkResource,
        out: &Bytes,
        save_editions: Option<EditionsSink>,
    ) {
        let Some(work) = edition.work.as_ref() else {
            return;
        };
        let is_best = work.best_book.legacy_id == book_id;

        // If a work isn't already cached with this ID, and this book is the
        // best edition, write one using our edition as a starting point.
        if is_best && self.cache.get(&work_key(work_rsc.foreign_id)).await.is_none() {
            self.cache
                .set(&work_key(work_rsc.foreign_id), out.clone(), ttl::WORK)
                .await;
        }

        // Likewise seed an author we have never seen, so the KCA is
        // recoverable without another upstream round trip. The plain TTL
        // (no fuzz headroom) means the next author fetch still refreshes.
        if let Some(author) = work_rsc.authors.first() {
            if self.cache.get(&author_key(author.foreign_id)).await.is_none() {
                if let Ok(author_bytes) = serde_json::to_vec(author) {
                    self.cache
                        .set(
                            &author_key(author.foreign_id),
                            Bytes::from(author_bytes),
                            ttl::AUTHOR,
                        )
                        .await;
                }
            }
        }

        let Some(save_editions) = save_editions else {
            return;
        };
        if !is_best {
            return;
        }

        let mut editions: HashMap<EditionDedupe, WorkResource> = HashMap::new();
        for edge in &work.editions.edges {
            let key = EditionDedupe {
                title: edge.node.title.to_uppercase(),
                language: iso639_3(&edge.node.details.language.name).to_string(),
                audio: edge.node.details.format == "Audible Audio",
            };
            if editions.contains_key(&key) {
                continue; // Already saw an edition similar to this one.
            }
            editions.insert(key, map_work_resource(&edge.node, work));
        }

        if !editions.is_empty() {
            save_editions(editions.into_values().collect());
        }
    }
}

#[async_trait]
impl Getter for UpstreamGetter {
    async fn get_work(
        &self,
        work_id: i64,
        save_editions: Option<EditionsSink>,
    ) -> Result<(Bytes, i64), ProxyError> {
        let cached = self.cache.get_with_ttl(&work_key(work_id)).await;
        if let Some((work_bytes, ttl)) = &cached {
            if *ttl > std::time::Duration::ZERO {
                return Ok((work_bytes.clone(), 0));
            }
        }

        debug!(work_id, "getting work");

        // A stale hit still knows its best book, which spares the redirect
        // sniff below.
        if let Some((work_bytes, _)) = cached {
            if let Ok(work) = serde_json::from_slice::<WorkResource>(&work_bytes) {
                if work.best_book_id != 0 {
                    let (out, _, author_id) = self
                        .get_book(work.best_book_id, save_editions.clone())
                        .await?;
                    return Ok((out, author_id));
                }
            }
        }

        // The upstream's work page redirects to its canonical edition.
        let location = self
            .transport
            .head_location(&format!("/work/{work_id}"))
            .await?;
        let book_id = path_to_id(&location).map_err(|err| {
            warn!(work_id, location = %location, "invalid redirect, likely auth error");
            err
        })?;

        let (out, _, author_id) = self.get_book(book_id, save_editions).await?;
        Ok((out, author_id))
    }

    async fn get_book(
        &self,
        book_id: i64,
        save_editions: Option<EditionsSink>,
    ) -> Result<(Bytes, i64, i64), ProxyError> {
        if let Some((work_bytes, ttl)) = self.cache.get_with_ttl(&book_key(book_id)).await {
            if ttl > std::time::Duration::ZERO {
                return Ok((work_bytes, 0, 0));
            }
        }

        debug!(book_id, "getting book");

        let edition = self.fetch_edition(book_id).await?;
        let Some(work) = edition.work.as_ref() else {
            warn!(book_id, "upstream edition has no work");
            return Err(ProxyError::NotFound);
        };
        if edition.primary_contributor_edge.node.legacy_id == 0 {
            warn!(book_id, "upstream edition has no author");
            return Err(ProxyError::NotFound);
        }

        let work_rsc = map_work_resource(&edition, work);
        let out = Bytes::from(serde_json::to_vec(&work_rsc)?);

        self.seed(book_id, &edition, &work_rsc, &out, save_editions)
            .await;

        let author_id = work_rsc
            .authors
            .first()
            .map(|author| author.foreign_id)
            .unwrap_or_default();
        Ok((out, work_rsc.foreign_id, author_id))
    }

    async fn get_author(&self, author_id: i64) -> Result<Bytes, ProxyError> {
        debug!(author_id, "getting author");

        let kca = self.resolve_author_kca(author_id).await?;

        // Load an initial page of works and return the author from the first
        // one that actually belongs to them. The controller attaches the
        // rest asynchronously.
        let page = self.works_page(&kca, None).await?;
        if page.edges.is_empty() {
            return Err(ProxyError::NotFound);
        }

        for edge in &page.edges {
            let best_book_id = edge.node.best_book.legacy_id;
            if best_book_id == 0 {
                continue;
            }
            let (work_bytes, _, _) = match self.get_book(best_book_id, None).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(author_id, book_id = best_book_id, error = %err, "problem getting initial book for author");
                    continue;
                }
            };

            let work: WorkResource = match serde_json::from_slice(&work_bytes) {
                Ok(work) => work,
                Err(err) => {
                    warn!(book_id = best_book_id, error = %err, "problem unmarshaling work for author");
                    let _ = self.cache.expire(&book_key(best_book_id)).await;
                    continue;
                }
            };

            for author in &work.authors {
                if author.foreign_id != author_id {
                    continue;
                }
                let mut found = author.clone();
                found.works = vec![work.clone()];
                return Ok(Bytes::from(serde_json::to_vec(&found)?));
            }
        }

        Err(ProxyError::NotFound)
    }

    async fn author_books(&self, author_id: i64) -> BoxStream<'static, i64> {
        let author_bytes = match self.get_author(author_id).await {
            Ok(author_bytes) => author_bytes,
            Err(err) => {
                warn!(author_id, error = %err, "problem getting author for full load");
                return Box::pin(futures::stream::empty());
            }
        };

        let author: AuthorResource = match serde_json::from_slice(&author_bytes) {
            Ok(author) => author,
            Err(err) => {
                warn!(author_id, error = %err, "problem unmarshaling author");
                return Box::pin(futures::stream::empty());
            }
        };

        let getter = Self {
            cache: Arc::clone(&self.cache),
            gql: Arc::clone(&self.gql),
            transport: Arc::clone(&self.transport),
        };

        Box::pin(stream! {
            let mut after: Option<String> = None;
            loop {
                let page = match getter.works_page(&author.kca, after.as_deref()).await {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(author_id, error = %err, "problem getting author works");
                        return;
                    }
                };

                for edge in &page.edges {
                    let best = &edge.node.best_book;
                    // Make sure it's actually our author, not a translator.
                    if best.primary_contributor_edge.node.legacy_id != author_id {
                        continue;
                    }
                    if best.primary_contributor_edge.role != "Author" {
                        continue;
                    }
                    if best.legacy_id == 0 {
                        continue;
                    }
                    yield best.legacy_id;
                }

                if !page.page_info.has_next_page {
                    return;
                }
                after = Some(page.page_info.next_page_token);
            }
        })
    }
}

/// Map an upstream edition to the work-envelope resource the client expects.
fn map_work_resource(edition: &EditionDto, work: &WorkDto) -> WorkResource {
    let mut genres: Vec<String> = edition
        .book_genres
        .iter()
        .map(|edge| edge.genre.name.clone())
        .collect();
    if genres.is_empty() {
        genres = vec!["none".to_string()];
    }

    let mut series = Vec::new();
    for entry in &edition.book_series {
        let legacy_id = path_to_id(&entry.series.web_url).unwrap_or_default();
        let position = path_to_id(&entry.series_placement).unwrap_or_default();
        series.push(SeriesResource {
            kca: entry.series.id.clone(),
            title: entry.series.title.clone(),
            foreign_id: legacy_id,
            description: String::new(),
            link_items: vec![SeriesWorkLinkResource {
                position_in_series: entry.series_placement.clone(),
                series_position: position as i32,
                foreign_work_id: work.legacy_id,
                primary: false,
            }],
        });
    }

    let mut book_description = edition.description.trim().to_string();
    if book_description.is_empty() {
        book_description = "N/A".to_string(); // Must be set.
    }

    let mut book_rsc = BookResource {
        kca: edition.id.clone(),
        foreign_id: edition.legacy_id,
        asin: edition.details.asin.clone(),
        description: book_description,
        isbn13: edition.details.isbn13.clone(),
        title: edition.title_primary.clone(),
        full_title: edition.title.clone(),
        short_title: edition.title_primary.clone(),
        language: iso639_3(&edition.details.language.name).to_string(),
        format: edition.details.format.clone(),
        edition_information: String::new(),
        publisher: edition.details.publisher.clone(),
        image_url: edition.image_url.clone(),
        is_ebook: edition.details.format == "Kindle Edition",
        num_pages: edition.details.num_pages,
        rating_count: edition.stats.ratings_count,
        rating_sum: edition.stats.ratings_sum,
        average_rating: edition.stats.average_rating,
        url: edition.web_url.clone(),
        release_date: String::new(),
        contributors: Vec::new(),
    };

    if edition.details.publication_time != 0 {
        book_rsc.release_date = release_date(edition.details.publication_time);
    }

    let author = &edition.primary_contributor_edge.node;
    let mut author_description = author.description.trim().to_string();
    if author_description.is_empty() {
        author_description = "N/A".to_string(); // Must be set.
    }

    let mut author_rsc = AuthorResource {
        kca: author.id.clone(),
        name: author.name.clone(),
        foreign_id: author.legacy_id,
        url: author.web_url.clone(),
        image_url: author.profile_image_url.clone(),
        description: author_description,
        series: series.clone(),
        ..Default::default()
    };

    let mut work_rsc = WorkResource {
        title: work.best_book.title_primary.clone(),
        full_title: work.best_book.title.clone(),
        short_title: work.best_book.title_primary.clone(),
        kca: work.id.clone(),
        foreign_id: work.legacy_id,
        url: work.details.web_url.clone(),
        series,
        genres,
        related_works: Vec::new(),
        best_book_id: work.best_book.legacy_id,
        ..Default::default()
    };

    if work.details.publication_time != 0 {
        work_rsc.release_date = release_date(work.details.publication_time);
    } else if !book_rsc.release_date.is_empty() {
        work_rsc.release_date = book_rsc.release_date.clone();
    }

    book_rsc.contributors = vec![ContributorResource {
        foreign_id: author.legacy_id,
        role: "Author".to_string(),
    }];
    // The embedded author carries the work without its books; the outer
    // envelope carries the full shape.
    author_rsc.works = vec![work_rsc.clone()];
    work_rsc.authors = vec![author_rsc];
    work_rsc.books = vec![book_rsc];

    work_rsc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_edition() -> EditionDto {
        EditionDto {
            id: "kca-book".to_string(),
            legacy_id: 200,
            title: "Foo: A Subtitle".to_string(),
            title_primary: "Foo".to_string(),
            description: "  A story.  ".to_string(),
            web_url: "https://upstream.example/book/200".to_string(),
            details: DetailsDto {
                language: LanguageDto {
                    name: "French".to_string(),
                },
                format: "Paperback".to_string(),
                publication_time: 715_935_600_000,
                ..Default::default()
            },
            stats: StatsDto {
                ratings_count: 4,
                ratings_sum: 18,
                average_rating: 4.5,
            },
            primary_contributor_edge: ContributorEdgeDto {
                role: "Author".to_string(),
                node: AuthorNodeDto {
                    id: "kca-author".to_string(),
                    legacy_id: 1000,
                    name: "Someone".to_string(),
                    description: String::new(),
                    ..Default::default()
                },
            },
            ..Default::default()
        }
    }

    fn sample_work() -> WorkDto {
        WorkDto {
            id: "kca-work".to_string(),
            legacy_id: 1,
            best_book: BestBookDto {
                legacy_id: 100,
                title: "Foo: A Subtitle".to_string(),
                title_primary: "Foo".to_string(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn mapping_builds_the_work_envelope() {
        let work_rsc = map_work_resource(&sample_edition(), &sample_work());

        assert_eq!(work_rsc.foreign_id, 1);
        assert_eq!(work_rsc.best_book_id, 100);
        assert_eq!(work_rsc.title, "Foo");
        assert_eq!(work_rsc.full_title, "Foo: A Subtitle");
        assert_eq!(work_rsc.genres, vec!["none".to_string()]);

        // Exactly one book in the envelope, with a single primary author.
        assert_eq!(work_rsc.books.len(), 1);
        let book = &work_rsc.books[0];
        assert_eq!(book.foreign_id, 200);
        assert_eq!(book.language, "fra");
        assert_eq!(book.description, "A story.");
        assert_eq!(book.release_date, "1992-09-08 07:00:00");
        assert_eq!(book.contributors.len(), 1);
        assert_eq!(book.contributors[0].foreign_id, 1000);
        assert_eq!(book.contributors[0].role, "Author");

        assert_eq!(work_rsc.authors.len(), 1);
        let author = &work_rsc.authors[0];
        assert_eq!(author.foreign_id, 1000);
        assert_eq!(author.kca, "kca-author");
        assert_eq!(author.description, "N/A");
        // The embedded author's work copy has no books attached yet.
        assert_eq!(author.works.len(), 1);
        assert!(author.works[0].books.is_empty());

        // The work inherits the edition's release date when it has none.
        assert_eq!(work_rsc.release_date, "1992-09-08 07:00:00");
    }

    #[test]
    fn edition_dedupe_keys_on_title_language_and_audio() {
        let a = EditionDedupe {
            title: "FOO".to_string(),
            language: "eng".to_string(),
            audio: false,
        };
        let b = EditionDedupe {
            title: "FOO".to_string(),
            language: "eng".to_string(),
            audio: true,
        };
        let c = EditionDedupe {
            title: "FOO".to_string(),
            language: "fra".to_string(),
            audio: false,
        };

        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn dto_decodes_from_camel_case() {
        let raw = json!({
            "legacyId": 7,
            "titlePrimary": "Foo",
            "details": { "numPages": 300, "language": { "name": "English" } },
            "stats": { "ratingsCount": 2, "ratingsSum": 9 },
        });

        let edition: EditionDto = serde_json::from_value(raw).expect("decodable DTO");
        assert_eq!(edition.legacy_id, 7);
        assert_eq!(edition.title_primary, "Foo");
        assert_eq!(edition.details.num_pages, 300);
        assert_eq!(edition.stats.ratings_sum, 9);
    }
}
