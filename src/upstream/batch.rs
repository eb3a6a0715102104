//! Batched GraphQL client.
//!
//! Callers issue ordinary single-query requests; internally every call is
//! appended to the newest open batch and shipped as one multi-field
//! operation on the next flush tick. To keep distinct queries from
//! colliding, every variable is renamed to `{alias}_{original}` and every
//! top-level selection field is aliased with a short random tag. Field-level
//! errors are demultiplexed back to the one subscriber whose alias matches
//! the error's path; transport errors fan out to the whole batch.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use graphql_parser::Pos;
use graphql_parser::query::{
    Definition, Document, OperationDefinition, Query, Selection, SelectionSet, Value, parse_query,
};
use once_cell::sync::Lazy;
use rand::Rng;
use serde_json::{Map as JsonMap, Value as Json, json};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::cache::lock::mutex_lock;
use crate::domain::ProxyError;
use crate::upstream::UpstreamTransport;

const SOURCE: &str = "upstream::batch";
const ALIAS_LEN: usize = 8;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Fragment definitions are static, so their printed form is cached globally
/// across batches.
static FRAGMENTS: Lazy<Mutex<HashMap<String, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How often the flusher ships the oldest batch.
    pub every: Duration,
    /// Most queries per batch; overflow opens a fresh batch.
    pub batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            every: Duration::from_millis(500),
            batch_size: 6,
        }
    }
}

struct Subscriber {
    /// The original top-level field name, so the response can be remarshaled
    /// into the shape the caller asked for.
    field: String,
    tx: oneshot::Sender<Result<Json, ProxyError>>,
}

struct Batch {
    /// Rewritten single-operation documents, re-parsed and merged at flush.
    doc_texts: Vec<String>,
    vars: JsonMap<String, Json>,
    fragment_names: BTreeSet<String>,
    subscribers: HashMap<String, Subscriber>,
    op_name: Option<String>,
}

impl Batch {
    fn new() -> Self {
        Self {
            doc_texts: Vec::new(),
            vars: JsonMap::new(),
            fragment_names: BTreeSet::new(),
            subscribers: HashMap::new(),
            op_name: None,
        }
    }
}

struct QueueState {
    queue: VecDeque<Batch>,
}

/// GraphQL client that merges concurrent queries into single multi-field
/// requests to make better use of a request-per-minute budget.
pub struct BatchedClient {
    url: String,
    transport: Arc<UpstreamTransport>,
    state: Mutex<QueueState>,
    config: Mutex<BatchConfig>,

    batches_sent: AtomicU32,
    queries_sent: AtomicU32,
}

impl BatchedClient {
    /// Create the client and start its flusher and stats loops.
    pub fn new(
        url: impl Into<String>,
        transport: Arc<UpstreamTransport>,
        config: BatchConfig,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            url: url.into(),
            transport,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
            }),
            config: Mutex::new(config),
            batches_sent: AtomicU32::new(0),
            queries_sent: AtomicU32::new(0),
        });

        let flusher = Arc::clone(&client);
        tokio::spawn(async move {
            loop {
                let every = mutex_lock(&flusher.config, SOURCE, "flusher").every;
                tokio::time::sleep(every).await;
                flusher.flush();
            }
        });

        let stats = Arc::clone(&client);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                let waiting = mutex_lock(&stats.state, SOURCE, "stats").queue.len();
                let batches = stats.batches_sent.load(Ordering::Relaxed);
                let queries = stats.queries_sent.load(Ordering::Relaxed);
                debug!(
                    batches_waiting = waiting,
                    batches_sent = batches,
                    queries_sent = queries,
                    average_batch_size = queries as f32 / batches.max(1) as f32,
                    "query stats"
                );
            }
        });

        client
    }

    /// Issue a query. The caller's view is a normal single-query RPC; the
    /// returned value is `{ "<original field>": <data> }`.
    pub async fn make_request(&self, query: &str, variables: Json) -> Result<Json, ProxyError> {
        let rx = self.enqueue(query, variables)?;
        rx.await
            .map_err(|_| ProxyError::transport("batched query dropped"))?
    }

    /// Adjust the flush period and batch size at runtime. Counters reset so
    /// the average-batch-size stat reflects the new settings.
    pub fn reconfigure(&self, every: Option<Duration>, batch_size: Option<usize>) {
        let mut config = mutex_lock(&self.config, SOURCE, "reconfigure");
        if let Some(every) = every.filter(|e| !e.is_zero()) {
            config.every = every;
            warn!(every_ms = every.as_millis() as u64, "set batch flush period");
        }
        if let Some(batch_size) = batch_size.filter(|s| *s > 0) {
            config.batch_size = batch_size;
            warn!(batch_size, "set batch size");
        }
        self.batches_sent.store(0, Ordering::Relaxed);
        self.queries_sent.store(0, Ordering::Relaxed);
    }

    fn enqueue(
        &self,
        query: &str,
        variables: Json,
    ) -> Result<oneshot::Receiver<Result<Json, ProxyError>>, ProxyError> {
        let alias = random_alias(ALIAS_LEN);
        let rewritten = rewrite_query(query, &alias, &variables)?;

        let (tx, rx) = oneshot::channel();
        let batch_size = mutex_lock(&self.config, SOURCE, "enqueue").batch_size;
        let mut state = mutex_lock(&self.state, SOURCE, "enqueue");

        // Take the youngest batch if it has room, otherwise open a new one.
        let open = state
            .queue
            .back()
            .is_some_and(|batch| batch.subscribers.len() < batch_size);
        if !open {
            state.queue.push_back(Batch::new());
        }
        let batch = state.queue.back_mut().expect("just ensured");

        if batch.op_name.is_none() {
            batch.op_name = rewritten.op_name.clone();
        }
        batch.doc_texts.push(rewritten.doc_text);
        for (name, value) in rewritten.vars {
            batch.vars.insert(name, value);
        }
        batch.fragment_names.extend(rewritten.fragment_names);
        batch.subscribers.insert(
            alias,
            Subscriber {
                field: rewritten.field,
                tx,
            },
        );

        Ok(rx)
    }

    /// Pop the oldest batch and ship it. The network round trip runs in its
    /// own task so the next batch accumulates without waiting.
    fn flush(self: &Arc<Self>) {
        let batch = {
            let mut state = mutex_lock(&self.state, SOURCE, "flush");
            match state.queue.pop_front() {
                Some(batch) => batch,
                None => return, // Nothing to do yet.
            }
        };

        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.queries_sent
            .fetch_add(batch.subscribers.len() as u32, Ordering::Relaxed);

        let (query, op_name) = match build_batch_query(&batch) {
            Ok(built) => built,
            Err(err) => {
                // Dropping the subscribers resolves every caller with an
                // error through the closed channel.
                error!(error = %err, "unable to build batched query");
                return;
            }
        };

        let mut body = json!({
            "query": query,
            "variables": Json::Object(batch.vars.clone()),
        });
        if let Some(op_name) = op_name {
            body["operationName"] = Json::String(op_name);
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            let result = client
                .transport
                .post_json(&client.url, &body, REQUEST_TIMEOUT)
                .await;

            let response = match result {
                Ok(response) => response.json::<Json>().await.map_err(ProxyError::from),
                Err(err) => Err(err),
            };

            dispatch(batch.subscribers, response);
        });
    }
}

/// Route a batch response back to its subscribers.
fn dispatch(mut subscribers: HashMap<String, Subscriber>, response: Result<Json, ProxyError>) {
    let body = match response {
        Ok(body) => body,
        Err(err) => {
            // The transport itself failed: everyone gets the same error.
            warn!(count = subscribers.len(), error = %err, "batched query error");
            for (_, subscriber) in subscribers {
                let _ = subscriber.tx.send(Err(err.clone()));
            }
            return;
        }
    };

    // Field-level errors fail only the subscriber whose alias matches the
    // error's path.
    if let Some(errors) = body.get("errors").and_then(Json::as_array) {
        for error in errors {
            let Some(alias) = error
                .pointer("/path/0")
                .and_then(Json::as_str)
                .map(ToString::to_string)
            else {
                continue;
            };
            let Some(subscriber) = subscribers.remove(&alias) else {
                continue;
            };
            let message = error
                .get("message")
                .and_then(Json::as_str)
                .unwrap_or("graphql error");
            let _ = subscriber.tx.send(Err(field_error(message)));
        }
    }

    let data = body.get("data").cloned().unwrap_or(Json::Null);
    for (alias, subscriber) in subscribers {
        let value = data.get(&alias).cloned().unwrap_or(Json::Null);
        let _ = subscriber.tx.send(Ok(json!({ subscriber.field: value })));
    }
}

/// Translate a field-level GraphQL error into a status-bearing error. The
/// upstream reports failed fields as strings like "Request failed with
/// status code 404"; surface that code directly when present.
fn field_error(message: &str) -> ProxyError {
    if let Some(index) = message.find("status code") {
        let digits: String = message[index..]
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        if let Ok(code) = digits.parse::<u16>() {
            return ProxyError::from_status(code);
        }
    }
    ProxyError::transport(format!("graphql error: {message}"))
}

struct RewrittenQuery {
    doc_text: String,
    field: String,
    op_name: Option<String>,
    vars: JsonMap<String, Json>,
    fragment_names: Vec<String>,
}

/// Parse a single query, rename its variables to `{alias}_{orig}`, alias its
/// top-level selection fields, and capture its fragments into the global
/// cache. Returns the printed rewritten operation.
fn rewrite_query(query: &str, alias: &str, variables: &Json) -> Result<RewrittenQuery, ProxyError> {
    let mut doc = parse_query::<String>(query)
        .map_err(|err| ProxyError::decode(format!("failed to parse query: {err}")))?;

    let incoming_vars = variables.as_object().cloned().unwrap_or_default();

    let mut field = String::new();
    let mut op_name = None;
    let mut vars = JsonMap::new();
    let mut fragment_names = Vec::new();
    let mut operations = Vec::new();

    for definition in std::mem::take(&mut doc.definitions) {
        match definition {
            Definition::Fragment(fragment) => {
                let name = fragment.name.clone();
                let mut cache = mutex_lock(&FRAGMENTS, SOURCE, "rewrite");
                cache.entry(name.clone()).or_insert_with(|| {
                    let printed = Document::<String> {
                        definitions: vec![Definition::Fragment(fragment)],
                    };
                    printed.to_string().trim_end().to_string()
                });
                fragment_names.push(name);
            }
            Definition::Operation(operation) => {
                let mut op = normalize_operation(operation);
                if op_name.is_none() {
                    op_name = op.name.clone();
                }

                let mut rename = HashMap::new();
                for var_def in &mut op.variable_definitions {
                    let renamed = format!("{alias}_{}", var_def.name);
                    rename.insert(var_def.name.clone(), renamed.clone());
                    vars.insert(
                        renamed.clone(),
                        incoming_vars.get(&var_def.name).cloned().unwrap_or(Json::Null),
                    );
                    var_def.name = renamed;
                }

                rewrite_selection_set(&mut op.selection_set, &rename, true, alias, &mut field);
                operations.push(Definition::Operation(OperationDefinition::Query(op)));
            }
        }
    }

    if operations.is_empty() {
        return Err(ProxyError::decode("query contains no operation"));
    }

    let doc_text = Document::<String> {
        definitions: operations,
    }
    .to_string();

    Ok(RewrittenQuery {
        doc_text,
        field,
        op_name,
        vars,
        fragment_names,
    })
}

/// Collapse every operation form into a plain query so batches can merge.
fn normalize_operation(operation: OperationDefinition<'_, String>) -> Query<'_, String> {
    match operation {
        OperationDefinition::Query(query) => query,
        OperationDefinition::Mutation(mutation) => Query {
            position: mutation.position,
            name: mutation.name,
            variable_definitions: mutation.variable_definitions,
            directives: mutation.directives,
            selection_set: mutation.selection_set,
        },
        OperationDefinition::Subscription(subscription) => Query {
            position: subscription.position,
            name: subscription.name,
            variable_definitions: subscription.variable_definitions,
            directives: subscription.directives,
            selection_set: subscription.selection_set,
        },
        OperationDefinition::SelectionSet(selection_set) => Query {
            position: Pos { line: 0, column: 0 },
            name: None,
            variable_definitions: Vec::new(),
            directives: Vec::new(),
            selection_set,
        },
    }
}

fn rewrite_selection_set(
    set: &mut SelectionSet<'_, String>,
    rename: &HashMap<String, String>,
    top_level: bool,
    alias: &str,
    field_out: &mut String,
) {
    for selection in &mut set.items {
        match selection {
            Selection::Field(field) => {
                if top_level {
                    *field_out = field.name.clone();
                    field.alias = Some(alias.to_string());
                }
                for (_, value) in &mut field.arguments {
                    rewrite_value(value, rename);
                }
                for directive in &mut field.directives {
                    for (_, value) in &mut directive.arguments {
                        rewrite_value(value, rename);
                    }
                }
                rewrite_selection_set(&mut field.selection_set, rename, false, alias, field_out);
            }
            Selection::InlineFragment(inline) => {
                rewrite_selection_set(&mut inline.selection_set, rename, false, alias, field_out);
            }
            Selection::FragmentSpread(_) => {}
        }
    }
}

fn rewrite_value(value: &mut Value<'_, String>, rename: &HashMap<String, String>) {
    match value {
        Value::Variable(name) => {
            if let Some(renamed) = rename.get(name) {
                *name = renamed.clone();
            }
        }
        Value::List(items) => {
            for item in items {
                rewrite_value(item, rename);
            }
        }
        Value::Object(fields) => {
            for (_, item) in fields.iter_mut() {
                rewrite_value(item, rename);
            }
        }
        _ => {}
    }
}

/// Merge a batch's rewritten operations into one query string.
fn build_batch_query(batch: &Batch) -> Result<(String, Option<String>), ProxyError> {
    let mut parsed = Vec::with_capacity(batch.doc_texts.len());
    for text in &batch.doc_texts {
        parsed.push(
            parse_query::<String>(text)
                .map_err(|err| ProxyError::decode(format!("failed to re-parse query: {err}")))?,
        );
    }

    let mut merged: Option<Query<'_, String>> = None;
    for doc in &mut parsed {
        for definition in doc.definitions.drain(..) {
            let Definition::Operation(operation) = definition else {
                continue;
            };
            let op = normalize_operation(operation);
            match &mut merged {
                None => merged = Some(op),
                Some(base) => {
                    base.variable_definitions.extend(op.variable_definitions);
                    base.selection_set.items.extend(op.selection_set.items);
                }
            }
        }
    }

    let mut merged = merged.ok_or_else(|| ProxyError::decode("empty batch"))?;
    merged.name = batch.op_name.clone();

    let document = Document {
        definitions: vec![Definition::Operation(OperationDefinition::Query(merged))],
    };

    let mut output = document.to_string();
    let cache = mutex_lock(&FRAGMENTS, SOURCE, "build");
    for name in &batch.fragment_names {
        if let Some(text) = cache.get(name) {
            output.push('\n');
            output.push_str(text);
        }
    }

    Ok((output, batch.op_name.clone()))
}

fn random_alias(len: usize) -> String {
    const RUNES: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| RUNES[rng.gen_range(0..RUNES.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY: &str =
        "query GetBook($id: Int!) { bookByLegacyId(legacyId: $id) { title ratingCount } }";

    #[test]
    fn rewrite_renames_variables_and_aliases_fields() {
        let rewritten =
            rewrite_query(QUERY, "abcdefgh", &json!({ "id": 42 })).expect("parseable query");

        assert_eq!(rewritten.field, "bookByLegacyId");
        assert_eq!(rewritten.op_name.as_deref(), Some("GetBook"));
        assert!(rewritten.doc_text.contains("abcdefgh: bookByLegacyId"));
        assert!(rewritten.doc_text.contains("$abcdefgh_id"));
        assert!(!rewritten.doc_text.contains("$id:"));
        assert_eq!(rewritten.vars.get("abcdefgh_id"), Some(&json!(42)));
    }

    #[test]
    fn rewrite_rejects_malformed_queries() {
        assert!(rewrite_query("query {", "abcdefgh", &Json::Null).is_err());
    }

    #[test]
    fn build_merges_queries_into_one_operation() {
        let mut batch = Batch::new();

        for (alias, id) in [("aaaaaaaa", 1), ("bbbbbbbb", 2)] {
            let rewritten = rewrite_query(QUERY, alias, &json!({ "id": id })).expect("parseable");
            if batch.op_name.is_none() {
                batch.op_name = rewritten.op_name.clone();
            }
            batch.doc_texts.push(rewritten.doc_text);
            for (name, value) in rewritten.vars {
                batch.vars.insert(name, value);
            }
        }

        let (query, op_name) = build_batch_query(&batch).expect("buildable");

        assert_eq!(op_name.as_deref(), Some("GetBook"));
        assert!(query.contains("aaaaaaaa: bookByLegacyId"));
        assert!(query.contains("bbbbbbbb: bookByLegacyId"));
        assert!(query.contains("$aaaaaaaa_id: Int!"));
        assert!(query.contains("$bbbbbbbb_id: Int!"));
        // Exactly one merged operation.
        assert_eq!(query.matches("query GetBook").count(), 1);
        assert_eq!(batch.vars.len(), 2);
    }

    #[test]
    fn fragments_are_deduplicated_by_name() {
        let fragmented = "query GetBook($id: Int!) { bookByLegacyId(legacyId: $id) { ...info } } \
                          fragment info on Book { title }";

        let mut batch = Batch::new();
        for alias in ["cccccccc", "dddddddd"] {
            let rewritten =
                rewrite_query(fragmented, alias, &json!({ "id": 1 })).expect("parseable");
            batch.doc_texts.push(rewritten.doc_text);
            batch.fragment_names.extend(rewritten.fragment_names);
            for (name, value) in rewritten.vars {
                batch.vars.insert(name, value);
            }
        }

        let (query, _) = build_batch_query(&batch).expect("buildable");
        assert_eq!(query.matches("fragment info on Book").count(), 1);
    }

    #[test]
    fn field_errors_extract_status_codes() {
        assert_eq!(
            field_error("Request failed with status code 404"),
            ProxyError::NotFound
        );
        assert_eq!(
            field_error("Request failed with status code 429"),
            ProxyError::RateLimited
        );
        assert!(matches!(
            field_error("something else entirely"),
            ProxyError::Transport(_)
        ));
    }

    #[test]
    fn random_aliases_are_alphabetic() {
        let alias = random_alias(ALIAS_LEN);
        assert_eq!(alias.len(), ALIAS_LEN);
        assert!(alias.chars().all(|c| c.is_ascii_alphabetic()));
    }
}
