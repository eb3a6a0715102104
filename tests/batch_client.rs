//! HTTP-level tests for the batched GraphQL client: batching behavior,
//! per-field error isolation, and transport-error fan-out.

use std::sync::Arc;
use std::time::Duration;

use folio::domain::ProxyError;
use folio::upstream::{BatchConfig, BatchedClient, Throttle, UpstreamTransport};
use serde_json::{Value as Json, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const QUERY: &str =
    "query GetBook($legacyId: Int!) { bookByLegacyId(legacyId: $legacyId) { title } }";

/// Answers a merged batch query by inspecting its renamed variables: every
/// `{alias}_legacyId` yields a field under that alias, except the magic ID
/// 404 which produces a field-level error instead.
struct GraphqlResponder;

impl Respond for GraphqlResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Json = serde_json::from_slice(&request.body).expect("json request body");
        let variables = body["variables"].as_object().cloned().unwrap_or_default();

        let mut data = serde_json::Map::new();
        let mut errors = Vec::new();

        for (name, value) in variables {
            let Some(alias) = name.strip_suffix("_legacyId") else {
                continue;
            };
            if value == json!(404) {
                errors.push(json!({
                    "message": "Request failed with status code 404",
                    "path": [alias],
                }));
                continue;
            }
            data.insert(
                alias.to_string(),
                json!({ "title": format!("Book {value}") }),
            );
        }

        ResponseTemplate::new(200).set_body_json(json!({
            "data": data,
            "errors": errors,
        }))
    }
}

fn client(url: String, every: Duration, batch_size: usize) -> Arc<BatchedClient> {
    let throttle = Arc::new(Throttle::per_minute(6000));
    let transport = Arc::new(
        UpstreamTransport::new("upstream.example.com", throttle, None, None)
            .expect("transport builds"),
    );
    BatchedClient::new(url, transport, BatchConfig { every, batch_size })
}

#[tokio::test]
async fn concurrent_queries_share_one_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(GraphqlResponder)
        .expect(1)
        .mount(&server)
        .await;

    let client = client(
        format!("{}/graphql", server.uri()),
        Duration::from_millis(100),
        6,
    );

    let mut handles = Vec::new();
    for id in [1_i64, 2, 3, 5] {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client
                .make_request(QUERY, json!({ "legacyId": id }))
                .await
        }));
    }

    for (index, handle) in handles.into_iter().enumerate() {
        let response = handle.await.expect("task").expect("query succeeds");
        let title = response["bookByLegacyId"]["title"]
            .as_str()
            .expect("title present");
        assert!(title.starts_with("Book "), "response {index}: {title}");
    }

    // All four queries went out as exactly one HTTP request.
    server.verify().await;
}

#[tokio::test]
async fn batch_overflow_produces_distinct_round_trips() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(GraphqlResponder)
        .expect(2)
        .mount(&server)
        .await;

    // With room for only one query per batch, two concurrent calls spill
    // into two batches and therefore two requests.
    let client = client(
        format!("{}/graphql", server.uri()),
        Duration::from_millis(50),
        1,
    );

    let first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.make_request(QUERY, json!({ "legacyId": 1 })).await })
    };
    let second = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.make_request(QUERY, json!({ "legacyId": 2 })).await })
    };

    first.await.expect("task").expect("first query succeeds");
    second.await.expect("task").expect("second query succeeds");

    server.verify().await;
}

#[tokio::test]
async fn field_errors_fail_only_their_subscriber() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(GraphqlResponder)
        .expect(1)
        .mount(&server)
        .await;

    let client = client(
        format!("{}/graphql", server.uri()),
        Duration::from_millis(100),
        6,
    );

    let ok = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.make_request(QUERY, json!({ "legacyId": 7 })).await })
    };
    let missing = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.make_request(QUERY, json!({ "legacyId": 404 })).await })
    };

    let response = ok.await.expect("task").expect("healthy query succeeds");
    assert_eq!(response["bookByLegacyId"]["title"], json!("Book 7"));

    let error = missing.await.expect("task").expect_err("missing query fails");
    assert_eq!(error, ProxyError::NotFound);

    server.verify().await;
}

#[tokio::test]
async fn transport_errors_fan_out_to_the_whole_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client(
        format!("{}/graphql", server.uri()),
        Duration::from_millis(50),
        6,
    );

    let first = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.make_request(QUERY, json!({ "legacyId": 1 })).await })
    };
    let second = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.make_request(QUERY, json!({ "legacyId": 2 })).await })
    };

    assert_eq!(
        first.await.expect("task"),
        Err(ProxyError::Status(500))
    );
    assert_eq!(
        second.await.expect("task"),
        Err(ProxyError::Status(500))
    );
}

#[tokio::test]
async fn reconfigure_adjusts_flush_cadence() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(GraphqlResponder)
        .mount(&server)
        .await;

    // Tightening the cadence and shrinking the batch at runtime must not
    // disturb queries issued afterwards. The new period applies from the
    // flusher's next wakeup.
    let client = client(
        format!("{}/graphql", server.uri()),
        Duration::from_millis(100),
        6,
    );
    client.reconfigure(Some(Duration::from_millis(20)), Some(2));

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        client.make_request(QUERY, json!({ "legacyId": 9 })),
    )
    .await
    .expect("resolves promptly")
    .expect("query succeeds");

    assert_eq!(response["bookByLegacyId"]["title"], json!("Book 9"));
}
