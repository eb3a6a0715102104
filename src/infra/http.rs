//! HTTP surface.
//!
//! Thin glue around the controller: muxing, ID parsing, response headers,
//! and the reconfigure escape hatch. Reads are O(1) against the cache; every
//! DELETE is an expiry (data stays put for stale-while-revalidate) rather
//! than a hard delete.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{ConnectInfo, Json, Path, Query, RawQuery, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, VARY};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::{author_key, book_key, work_key};
use crate::controller::Controller;
use crate::domain::{AuthorResource, BulkBookResource, ProxyError, SeriesResource, WorkResource};
use crate::upstream::BatchedClient;
use crate::util::path_to_id;

/// TTL advertised on responses that depend on query parameters.
const SEARCH_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct HttpState {
    pub controller: Controller,
    pub batch: Option<Arc<BatchedClient>>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/work/{id}", get(get_work).delete(delete_work))
        .route("/book/bulk", get(bulk_get).post(bulk_post))
        .route("/book/{id}", get(get_book).delete(delete_book))
        .route("/author/changed", get(author_changed))
        .route("/author/{id}", get(get_author).delete(delete_author))
        .route("/reconfigure", post(reconfigure))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
}

/// Set cache response headers. `s-maxage` controls CDN cache time.
///
/// Pass `vary_params` when the response depends on query parameters;
/// everything else also advertises `No-Vary-Search` so shared caches can
/// ignore them.
fn cache_for(response: &mut Response, ttl: Duration, vary_params: bool) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("public, s-maxage={}", ttl.as_secs())) {
        headers.insert(CACHE_CONTROL, value);
    }
    headers.insert(VARY, HeaderValue::from_static("Content-Type,Accept-Encoding"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if !vary_params {
        headers.insert("No-Vary-Search", HeaderValue::from_static("params"));
    }
}

async fn get_work(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    let work_id = match path_to_id(&id) {
        Ok(work_id) => work_id,
        Err(err) => return err.into_response(),
    };

    match state.controller.get_work(work_id).await {
        Ok((bytes, ttl)) => {
            let mut response = bytes.into_response();
            if ttl > Duration::ZERO {
                cache_for(&mut response, ttl, false);
            }
            response
        }
        Err(err) => err.into_response(),
    }
}

async fn delete_work(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    let work_id = match path_to_id(&id) {
        Ok(work_id) => work_id,
        Err(err) => return err.into_response(),
    };

    let _ = state.controller.cache().expire(&work_key(work_id)).await;
    StatusCode::OK.into_response()
}

/// The client expects every book lookup to redirect. Rather than serving a
/// "fat" work with every edition attached, redirect to the author filtered
/// down to this edition.
async fn get_book(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    let book_id = match path_to_id(&id) {
        Ok(book_id) => book_id,
        Err(err) => return err.into_response(),
    };

    let (bytes, ttl) = match state.controller.get_book(book_id).await {
        Ok(found) => found,
        Err(err) => return err.into_response(),
    };

    let envelope: WorkResource = match serde_json::from_slice(&bytes) {
        Ok(envelope) => envelope,
        Err(err) => return ProxyError::from(err).into_response(),
    };

    let mut response = if let Some(author) = envelope.authors.first() {
        Redirect::to(&format!(
            "/author/{}?edition={book_id}",
            author.foreign_id
        ))
        .into_response()
    } else {
        // Shouldn't happen: every book carries its author.
        Redirect::to(&format!("/work/{}", envelope.foreign_id)).into_response()
    };

    if ttl > Duration::ZERO {
        cache_for(&mut response, ttl, false);
    }
    response
}

async fn delete_book(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    let book_id = match path_to_id(&id) {
        Ok(book_id) => book_id,
        Err(err) => return err.into_response(),
    };

    let _ = state.controller.cache().expire(&book_key(book_id)).await;
    StatusCode::OK.into_response()
}

/// Bulk lookups arrive as POSTs, which aren't cacheable. Redirect to a GET
/// with query parameters so the result can be cached.
async fn bulk_post(Json(ids): Json<Vec<i64>>) -> Response {
    if ids.is_empty() {
        return ProxyError::bad_request("missing \"ids\"").into_response();
    }

    let query: Vec<String> = ids.iter().map(|id| format!("id={id}")).collect();
    let target = format!("/book/bulk?{}", query.join("&"));
    debug!(url = %target, "redirecting bulk request");
    Redirect::to(&target).into_response()
}

async fn bulk_get(State(state): State<HttpState>, RawQuery(query): RawQuery) -> Response {
    let mut ids = Vec::new();
    for pair in query.as_deref().unwrap_or_default().split('&') {
        let Some(raw) = pair.strip_prefix("id=") else {
            continue;
        };
        match path_to_id(raw) {
            Ok(id) => ids.push(id),
            Err(err) => return err.into_response(),
        }
    }
    if ids.is_empty() {
        return ProxyError::bad_request("missing \"ids\"").into_response();
    }

    let lookups = ids
        .iter()
        .map(|&book_id| state.controller.get_book(book_id));
    let results = futures::future::join_all(lookups).await;

    let mut result = BulkBookResource::default();
    for (book_id, lookup) in ids.iter().zip(results) {
        let bytes = match lookup {
            Ok((bytes, _)) => bytes,
            Err(err) => {
                if !err.is_not_found() {
                    warn!(book_id, error = %err, "problem getting bulk book");
                }
                continue; // Ignore the error.
            }
        };

        let Ok(mut envelope) = serde_json::from_slice::<WorkResource>(&bytes) else {
            continue; // Ignore the error.
        };

        if !envelope.full_title.is_empty() {
            envelope.title = envelope.full_title.clone();
        }
        if let Some(book) = envelope.books.first_mut() {
            if !book.full_title.is_empty() {
                book.title = book.full_title.clone();
            }
        }

        let already_seen = envelope.authors.first().is_some_and(|author| {
            result
                .authors
                .iter()
                .any(|seen| seen.foreign_id == author.foreign_id)
        });
        if !already_seen {
            result.authors.extend(envelope.authors.clone());
        }
        result.works.push(envelope);
    }

    // Collect and de-dupe series across the returned authors.
    let mut seen_series = std::collections::HashSet::new();
    let mut series: Vec<SeriesResource> = Vec::new();
    for author in &result.authors {
        for entry in &author.series {
            if seen_series.insert(entry.foreign_id) {
                series.push(entry.clone());
            }
        }
    }
    result.series = series;

    // Most-rated works first.
    result.works.sort_by_key(|work| {
        std::cmp::Reverse(
            work.books
                .first()
                .map(|book| book.rating_count)
                .unwrap_or_default(),
        )
    });

    let mut response = match serde_json::to_vec(&result) {
        Ok(body) => body.into_response(),
        Err(err) => return ProxyError::from(err).into_response(),
    };
    cache_for(&mut response, SEARCH_TTL, true);
    response
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthorQuery {
    edition: Option<String>,
    full: Option<String>,
}

async fn get_author(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Query(params): Query<AuthorQuery>,
) -> Response {
    let author_id = match path_to_id(&id) {
        Ok(author_id) => author_id,
        Err(err) => return err.into_response(),
    };

    let (bytes, ttl) = match state.controller.get_author(author_id).await {
        Ok(found) => found,
        Err(err) => return err.into_response(),
    };

    // If a specific edition was requested (as with a /book redirect), mutate
    // the returned author to carry only that edition's work.
    if let Some(edition) = params.edition.as_deref() {
        let book_id = match path_to_id(edition) {
            Ok(book_id) => book_id,
            Err(err) => return err.into_response(),
        };

        let mut author: AuthorResource = match serde_json::from_slice(&bytes) {
            Ok(author) => author,
            Err(err) => return ProxyError::from(err).into_response(),
        };

        let (work_bytes, work_ttl) = match state.controller.get_book(book_id).await {
            Ok(found) => found,
            Err(err) => return err.into_response(),
        };
        let work: WorkResource = match serde_json::from_slice(&work_bytes) {
            Ok(work) => work,
            Err(err) => return ProxyError::from(err).into_response(),
        };

        author.works = vec![work];

        let mut response = match serde_json::to_vec(&author) {
            Ok(body) => body.into_response(),
            Err(err) => return ProxyError::from(err).into_response(),
        };
        if work_ttl > Duration::ZERO {
            cache_for(&mut response, work_ttl, true);
        }
        return response;
    }

    let mut response = bytes.into_response();
    if ttl > Duration::ZERO {
        cache_for(&mut response, ttl, true);
    }
    response
}

/// Expire the author and kick a refresh. `?full=true` also expires every
/// work and edition the author carries, which re-fetches the whole graph.
async fn delete_author(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Query(params): Query<AuthorQuery>,
) -> Response {
    let author_id = match path_to_id(&id) {
        Ok(author_id) => author_id,
        Err(err) => return err.into_response(),
    };

    let cache = state.controller.cache();
    let bytes = cache.get(&author_key(author_id)).await;
    let _ = cache.expire(&author_key(author_id)).await;

    let controller = state.controller.clone();
    let full = params.full.is_some_and(|full| !full.is_empty());
    tokio::spawn(async move {
        if full {
            if let Some(bytes) = bytes {
                if let Ok(author) = serde_json::from_slice::<AuthorResource>(&bytes) {
                    for work in &author.works {
                        for book in &work.books {
                            let _ = controller.cache().expire(&book_key(book.foreign_id)).await;
                        }
                        let _ = controller.cache().expire(&work_key(work.foreign_id)).await;
                    }
                }
            }
        }
        // Kick off a refresh.
        let _ = controller.get_author(author_id).await;
    });

    StatusCode::OK.into_response()
}

/// Enumerating every changed author would be uncacheable and expensive, so
/// the response tells the client to no-op; it will re-query `/author/{id}`
/// on its own cadence and pick up fresher data as entries expire.
async fn author_changed() -> Response {
    let mut response = r#"{"Limited": true, "Ids": []}"#.into_response();
    cache_for(&mut response, SEARCH_TTL, false);
    response
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReconfigureBody {
    every: Option<String>,
    #[serde(rename = "batchSize")]
    batch_size: Option<usize>,
}

/// Host-local tuning endpoint for the batched client.
async fn reconfigure(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<ReconfigureBody>>,
) -> Response {
    warn!(addr = %addr, "reconfigure request");

    if !host_local(addr.ip()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Some(batch) = state.batch.as_ref() else {
        return StatusCode::OK.into_response();
    };

    let body = body.map(|Json(body)| body).unwrap_or_default();
    let every = body.every.as_deref().and_then(parse_duration);
    batch.reconfigure(every, body.batch_size);

    StatusCode::OK.into_response()
}

/// Only clients inside 10.0.0.0/8 may reconfigure.
fn host_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[0] == 10,
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .is_some_and(|v4| v4.octets()[0] == 10),
    }
}

/// Parse durations like `750ms`, `2s`, `5m`, or `1h`. Bare numbers are
/// seconds.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, scale_ms) = if let Some(digits) = raw.strip_suffix("ms") {
        (digits, 1.0)
    } else if let Some(digits) = raw.strip_suffix('h') {
        (digits, 3_600_000.0)
    } else if let Some(digits) = raw.strip_suffix('m') {
        (digits, 60_000.0)
    } else if let Some(digits) = raw.strip_suffix('s') {
        (digits, 1000.0)
    } else {
        (raw, 1000.0)
    };

    let value: f64 = digits.trim().parse().ok()?;
    if value <= 0.0 || !value.is_finite() {
        return None;
    }
    Some(Duration::from_secs_f64(value * scale_ms / 1000.0))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use bytes::Bytes;
    use futures::stream::BoxStream;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    use crate::cache::{LayeredCache, MemoryCache};
    use crate::controller::{ControllerConfig, NoPersist};
    use crate::upstream::{EditionsSink, Getter};

    use super::*;

    struct EmptyGetter;

    #[async_trait]
    impl Getter for EmptyGetter {
        async fn get_work(
            &self,
            _work_id: i64,
            _save_editions: Option<EditionsSink>,
        ) -> Result<(Bytes, i64), ProxyError> {
            Err(ProxyError::NotFound)
        }

        async fn get_book(
            &self,
            _book_id: i64,
            _save_editions: Option<EditionsSink>,
        ) -> Result<(Bytes, i64, i64), ProxyError> {
            Err(ProxyError::NotFound)
        }

        async fn get_author(&self, _author_id: i64) -> Result<Bytes, ProxyError> {
            Err(ProxyError::NotFound)
        }

        async fn author_books(&self, _author_id: i64) -> BoxStream<'static, i64> {
            Box::pin(futures::stream::empty())
        }
    }

    fn router() -> Router {
        let cache = Arc::new(LayeredCache::new(vec![Arc::new(MemoryCache::new(
            1024 * 1024,
        ))]));
        let controller = Controller::new(
            cache,
            Arc::new(EmptyGetter),
            Arc::new(NoPersist),
            ControllerConfig::default(),
        );
        build_router(HttpState {
            controller,
            batch: None,
        })
    }

    #[tokio::test]
    async fn author_changed_returns_neutered_payload() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/author/changed?since=2024-01-01")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("No-Vary-Search").unwrap(),
            "params"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["Limited"], true);
        assert_eq!(value["Ids"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn malformed_ids_are_bad_requests() {
        for uri in ["/author/-1234", "/author/10000000000", "/work/0"] {
            let response = router()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn slugged_ids_parse_in_paths() {
        // The getter reports everything missing, so a parseable slug 404s
        // rather than 400ing.
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/book/27362503-it-ends-with-us")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bulk_post_redirects_to_cacheable_get() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/book/bulk")
                    .header("content-type", "application/json")
                    .body(Body::from("[1, 2, 3]"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "/book/bulk?id=1&id=2&id=3"
        );
    }

    #[tokio::test]
    async fn unknown_routes_404() {
        let response = router()
            .oneshot(
                Request::builder()
                    .uri("/search")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn durations_parse_with_suffixes() {
        assert_eq!(parse_duration("750ms"), Some(Duration::from_millis(750)));
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("-1s"), None);
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn reconfigure_is_gated_to_private_space() {
        assert!(host_local("10.1.2.3".parse().unwrap()));
        assert!(!host_local("11.1.2.3".parse().unwrap()));
        assert!(!host_local("127.0.0.1".parse().unwrap()));
        assert!(!host_local("192.168.1.1".parse().unwrap()));
        assert!(host_local("::ffff:10.0.0.1".parse().unwrap()));
        assert!(!host_local("::1".parse().unwrap()));
    }
}
