//! Save and reload cycles against the live mock server.
//!
//! # Design
//! Starts the mock server on a random port and drives the consumer and the
//! editable collection over real HTTP through `ReqwestTransport`. The server
//! state handle stays with the test so it can seed tags, arm the throttle and
//! inspect what the batches did.

use std::time::Duration;

use mock_server::AppState;
use portal_sync_core::{
    CallbackBundle, ConsumerConfig, CookieJar, EditableCollection, FieldList, HttpMethod, OptionRegistry,
    Outcome, QueryParams, RecordId, RecordState, RequestConsumer, RequestDescriptor, ReqwestTransport,
};
use serde_json::{json, Value};

/// Serve `state` on a random port and return the `/tags` endpoint URL.
async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mock_server::run_with_state(listener, state));
    format!("http://{addr}/tags")
}

fn consumer() -> RequestConsumer {
    let config = ConsumerConfig {
        backoff_ms: 5,
        ..ConsumerConfig::default()
    };
    RequestConsumer::with_config(ReqwestTransport::new(), config)
}

fn fields(v: Value) -> portal_sync_core::Fields {
    v.as_object().cloned().unwrap()
}

async fn fetch(consumer: &RequestConsumer, url: &str, query: QueryParams) -> Value {
    let outcome = consumer
        .start(RequestDescriptor::new(HttpMethod::Get, url).query(query))
        .await;
    assert!(outcome.is_success(), "GET {url} failed: {outcome:?}");
    outcome.data().clone()
}

#[tokio::test]
async fn new_tree_is_created_in_one_batch() {
    let state = AppState::new();
    let tags = serve(state.clone()).await;
    let consumer = consumer();

    let mut collection = EditableCollection::new(FieldList::new(["name"]));
    let food = collection.create_record(fields(json!({"name": "food"})));
    let fruit = collection.create_child(food, fields(json!({"name": "fruit"}))).unwrap();
    let apple = collection.create_child(fruit, fields(json!({"name": "apple"}))).unwrap();

    let skipped = collection.save(&consumer, &tags, &CallbackBundle::new()).await.unwrap();
    assert!(!skipped);

    let store = state.db.read().await;
    assert_eq!(store.len(), 3);
    let id_of = |key| match collection.get(key).unwrap().id() {
        Some(RecordId::Int(n)) => *n,
        other => panic!("unexpected id {other:?}"),
    };
    assert_eq!(store.get(id_of(food)).unwrap().parent, None);
    assert_eq!(store.get(id_of(fruit)).unwrap().parent, Some(id_of(food)));
    assert_eq!(store.get(id_of(apple)).unwrap().parent, Some(id_of(fruit)));
    for key in collection.walk() {
        assert_eq!(collection.get(key).unwrap().state(), RecordState::Persisted);
    }
}

#[tokio::test]
async fn edits_moves_and_removals_reach_the_server() {
    let state = AppState::new();
    {
        let mut store = state.db.write().await;
        let food = store.insert("food", None);
        store.insert("fruit", Some(food));
        store.insert("tools", None);
        store.insert("junk", None);
    }
    let tags = serve(state.clone()).await;
    let consumer = consumer();

    let mut collection = EditableCollection::new(FieldList::new(["name"]));
    let rows = fetch(&consumer, &tags, QueryParams::new().fields(["id", "name", "parent"])).await;
    collection.load_flat(&rows, "parent").unwrap();

    let key = |id: i64| collection.find_by_id(&RecordId::Int(id)).unwrap();
    let (food, fruit, tools, junk) = (key(1), key(2), key(3), key(4));
    collection.set_field(fruit, "name", json!("fresh fruit")).unwrap();
    collection.move_record(tools, Some(food), 0).unwrap();
    collection.remove_record(junk).unwrap();
    let kitchen = collection.create_child(tools, fields(json!({"name": "knives"}))).unwrap();

    collection.save(&consumer, &tags, &CallbackBundle::new()).await.unwrap();

    let store = state.db.read().await;
    assert_eq!(store.get(2).unwrap().name, "fresh fruit");
    assert_eq!(store.get(3).unwrap().parent, Some(1));
    assert!(store.get(4).is_none());
    let knives = match collection.get(kitchen).unwrap().id() {
        Some(RecordId::Int(n)) => *n,
        other => panic!("unexpected id {other:?}"),
    };
    assert_eq!(store.get(knives).unwrap().parent, Some(3));
    assert!(collection.pending().is_empty());
}

#[tokio::test]
async fn move_to_root_reaches_the_server() {
    let state = AppState::new();
    {
        let mut store = state.db.write().await;
        let food = store.insert("food", None);
        store.insert("fruit", Some(food));
    }
    let tags = serve(state.clone()).await;
    let consumer = consumer();

    let mut collection = EditableCollection::new(FieldList::new(["name"]));
    let rows = fetch(&consumer, &tags, QueryParams::new().fields(["id", "name", "parent"])).await;
    collection.load_flat(&rows, "parent").unwrap();
    let fruit = collection.find_by_id(&RecordId::Int(2)).unwrap();

    collection.move_record(fruit, None, 0).unwrap();
    collection.save(&consumer, &tags, &CallbackBundle::new()).await.unwrap();

    let record = collection.get(fruit).unwrap();
    assert_eq!(record.parent(), None);
    assert_eq!(record.state(), RecordState::Persisted);
    assert_eq!(state.db.read().await.get(2).unwrap().parent, None);
}

#[tokio::test]
async fn validation_errors_keep_records_for_retry() {
    let state = AppState::new();
    let tags = serve(state.clone()).await;
    let consumer = consumer();

    let mut collection = EditableCollection::new(FieldList::new(["name"]));
    let blank = collection.create_record(fields(json!({"name": ""})));
    collection.save(&consumer, &tags, &CallbackBundle::new()).await.unwrap();

    assert_eq!(collection.get(blank).unwrap().state(), RecordState::Transient);
    assert!(state.db.read().await.is_empty());

    collection.set_field(blank, "name", json!("named")).unwrap();
    collection.save(&consumer, &tags, &CallbackBundle::new()).await.unwrap();
    assert_eq!(collection.get(blank).unwrap().state(), RecordState::Persisted);
    assert_eq!(state.db.read().await.len(), 1);
}

#[tokio::test]
async fn throttled_requests_are_retried() {
    let state = AppState::new();
    state.throttle_next(2);
    let tags = serve(state.clone()).await;

    let outcome = consumer()
        .start(RequestDescriptor::new(HttpMethod::Get, &tags))
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.response().attempts, 3);
}

#[tokio::test]
async fn throttle_longer_than_budget_reports_busy() {
    let state = AppState::new();
    state.throttle_next(5);
    let tags = serve(state.clone()).await;

    let outcome = consumer()
        .start(
            RequestDescriptor::new(HttpMethod::Get, &tags)
                .retry_budget(1)
                .backoff(Duration::from_millis(1)),
        )
        .await;

    assert!(matches!(outcome, Outcome::ServerBusy { .. }));
    assert_eq!(state.throttled_remaining(), 3);
}

#[tokio::test]
async fn csrf_token_from_cookies_satisfies_server() {
    let state = AppState::new().require_csrf("x-csrftoken", "t0k");
    let tags = serve(state.clone()).await;
    let body = r#"[{"name": "food"}]"#;

    let anonymous = consumer()
        .start(RequestDescriptor::new(HttpMethod::Post, &tags).body(body))
        .await;
    assert_eq!(anonymous.response().status, 403);

    let cookies = CookieJar::parse("csrf_header_name=X-CSRFToken; csrf_cookie_name=csrftoken; csrftoken=t0k");
    let signed = consumer()
        .cookies(cookies)
        .start(RequestDescriptor::new(HttpMethod::Post, &tags).body(body))
        .await;
    assert_eq!(signed.response().status, 201);
}

#[tokio::test]
async fn registry_caches_lists_from_the_server() {
    let state = AppState::new();
    state.db.write().await.insert("admin", None);
    let tags = serve(state.clone()).await;

    let registry = OptionRegistry::new();
    registry.init(consumer()).await;
    let first = registry
        .get_or_load("tags", &tags, QueryParams::new().fields(["id", "name"]))
        .await
        .unwrap();
    state.db.write().await.insert("ignored", None);
    let second = registry.get_or_load("tags", &tags, QueryParams::new()).await.unwrap();

    assert_eq!(first.as_slice(), &[json!({"id": 1, "name": "admin"})]);
    assert_eq!(second.len(), 1);
}
