use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info, warn};

pub const NON_FIELD_ERRORS: &str = "non_field_errors";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parent: Option<i64>,
}

/// One item of a `POST /tags` batch.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateTag {
    pub name: Option<String>,
    pub description: Option<String>,
    pub exist_parent: Option<i64>,
    /// Index of an earlier item of the same batch.
    pub new_parent: Option<usize>,
    pub client_ref: Option<String>,
}

/// One item of a `PUT /tags` batch. Absent fields are left unchanged;
/// `"exist_parent": null` moves the tag to the root.
#[derive(Debug, Deserialize)]
pub struct UpdateTag {
    pub id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub exist_parent: Option<Option<i64>>,
}

/// Wraps whatever is present, `null` included, so an absent field stays
/// `None` and an explicit `null` becomes `Some(None)`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct DeleteTag {
    pub id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub fields: Option<String>,
    pub ordering: Option<String>,
    pub search: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug)]
pub struct Store {
    tags: BTreeMap<i64, Tag>,
    next_id: i64,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            tags: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl Store {
    pub fn insert(&mut self, name: &str, parent: Option<i64>) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tags.insert(
            id,
            Tag {
                id,
                name: name.to_string(),
                description: String::new(),
                parent,
            },
        );
        id
    }

    pub fn get(&self, id: i64) -> Option<&Tag> {
        self.tags.get(&id)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// `id` and every tag below it.
    fn subtree(&self, id: i64) -> Vec<i64> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            let current = out[i];
            out.extend(self.tags.values().filter(|t| t.parent == Some(current)).map(|t| t.id));
            i += 1;
        }
        out
    }
}

pub type Db = Arc<RwLock<Store>>;

/// Header name and expected token for unsafe methods.
#[derive(Clone, Debug)]
pub struct CsrfRequirement {
    pub header: String,
    pub token: String,
}

#[derive(Clone, Default)]
pub struct AppState {
    pub db: Db,
    throttle: Arc<AtomicU32>,
    csrf: Option<CsrfRequirement>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_csrf(mut self, header: impl Into<String>, token: impl Into<String>) -> Self {
        self.csrf = Some(CsrfRequirement {
            header: header.into(),
            token: token.into(),
        });
        self
    }

    /// Answer the next `count` requests with 429.
    pub fn throttle_next(&self, count: u32) {
        self.throttle.store(count, Ordering::SeqCst);
    }

    pub fn throttled_remaining(&self) -> u32 {
        self.throttle.load(Ordering::SeqCst)
    }
}

pub fn app() -> Router {
    app_with_state(AppState::new())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/tags", get(list_tags).post(create_tags).put(update_tags).delete(delete_tags))
        .route("/tags/{id}/children", get(list_children))
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, AppState::new()).await
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "mock server listening");
    }
    axum::serve(listener, app_with_state(state)).await
}

/// Throttle first, then CSRF on unsafe methods.
async fn guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let throttled = state
        .throttle
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if throttled {
        debug!(method = %request.method(), uri = %request.uri(), "throttled");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"detail": "Request was throttled."})),
        )
            .into_response();
    }

    if let Some(csrf) = &state.csrf {
        let safe = request.method().is_safe();
        let token = request
            .headers()
            .get(csrf.header.as_str())
            .and_then(|v| v.to_str().ok());
        if !safe && token != Some(csrf.token.as_str()) {
            warn!(method = %request.method(), uri = %request.uri(), "csrf check failed");
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"detail": "CSRF Failed: CSRF token missing or incorrect."})),
            )
                .into_response();
        }
    }
    next.run(request).await
}

fn tag_value(tag: &Tag) -> Value {
    json!({
        "id": tag.id,
        "name": tag.name,
        "description": tag.description,
        "parent": tag.parent,
    })
}

/// Keep only the comma-separated `fields`, when given.
fn project(value: Value, fields: Option<&str>) -> Value {
    match (fields, value) {
        (Some(fields), Value::Object(map)) => {
            let wanted: Vec<&str> = fields.split(',').map(str::trim).collect();
            Value::Object(
                map.into_iter()
                    .filter(|(k, _)| wanted.contains(&k.as_str()))
                    .collect(),
            )
        }
        (_, value) => value,
    }
}

/// Stable multi-key sort. Keys are applied from last to first so the first
/// key wins; unknown keys are skipped.
fn sort_tags(tags: &mut [Tag], ordering: Option<&str>) {
    let Some(ordering) = ordering else {
        return;
    };
    for key in ordering.split(',').rev().map(str::trim) {
        let (field, descending) = match key.strip_prefix('-') {
            Some(field) => (field, true),
            None => (key, false),
        };
        if field != "name" && field != "id" {
            continue;
        }
        tags.sort_by(|a, b| {
            let order = if field == "name" {
                a.name.cmp(&b.name)
            } else {
                a.id.cmp(&b.id)
            };
            if descending {
                order.reverse()
            } else {
                order
            }
        });
    }
}

fn list_response(mut tags: Vec<Tag>, params: &ListParams) -> Value {
    if let Some(search) = params.search.as_deref().filter(|s| !s.is_empty()) {
        let needle = search.to_lowercase();
        tags.retain(|t| t.name.to_lowercase().contains(&needle));
    }
    sort_tags(&mut tags, params.ordering.as_deref());
    let fields = params.fields.as_deref();
    let render = |tags: &[Tag]| -> Vec<Value> {
        tags.iter().map(|t| project(tag_value(t), fields)).collect()
    };

    let Some(page_size) = params.page_size.filter(|n| *n > 0) else {
        return Value::Array(render(&tags));
    };
    let page = params.page.unwrap_or(1).max(1);
    let count = tags.len();
    let start = (page - 1).saturating_mul(page_size).min(count);
    let end = start.saturating_add(page_size).min(count);
    let link = |p: usize| format!("?page={p}&page_size={page_size}");
    json!({
        "count": count,
        "next": (end < count).then(|| link(page + 1)),
        "previous": (page > 1).then(|| link(page - 1)),
        "results": render(&tags[start..end]),
    })
}

async fn list_tags(State(state): State<AppState>, Query(params): Query<ListParams>) -> Json<Value> {
    let store = state.db.read().await;
    let tags = store.tags.values().cloned().collect();
    Json(list_response(tags, &params))
}

async fn list_children(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, StatusCode> {
    let store = state.db.read().await;
    if store.get(id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let tags = store.tags.values().filter(|t| t.parent == Some(id)).cloned().collect();
    Ok(Json(list_response(tags, &params)))
}

fn field_error(errors: &mut Map<String, Value>, field: &str, message: String) {
    if let Value::Array(list) = errors.entry(field).or_insert_with(|| json!([])) {
        list.push(Value::String(message));
    }
}

fn validate_name(errors: &mut Map<String, Value>, name: Option<&str>, required: bool) {
    match name {
        None if required => field_error(errors, "name", "This field is required.".to_string()),
        Some(n) if n.trim().is_empty() => {
            field_error(errors, "name", "This field may not be blank.".to_string())
        }
        _ => {}
    }
}

/// 400 with one error object per submitted item, `{}` for valid ones.
fn batch_errors(errors: Vec<Map<String, Value>>) -> Option<Response> {
    if errors.iter().all(Map::is_empty) {
        return None;
    }
    let body: Vec<Value> = errors.into_iter().map(Value::Object).collect();
    Some((StatusCode::BAD_REQUEST, Json(Value::Array(body))).into_response())
}

async fn create_tags(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    Json(items): Json<Vec<CreateTag>>,
) -> Response {
    let mut store = state.db.write().await;

    let errors: Vec<Map<String, Value>> = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut errors = Map::new();
            validate_name(&mut errors, item.name.as_deref(), true);
            if let Some(parent) = item.exist_parent {
                if store.get(parent).is_none() {
                    field_error(&mut errors, NON_FIELD_ERRORS, format!("Parent {parent} does not exist."));
                }
            }
            if let Some(parent) = item.new_parent {
                if parent >= index {
                    field_error(
                        &mut errors,
                        NON_FIELD_ERRORS,
                        format!("new_parent {parent} must point at an earlier record."),
                    );
                }
            }
            errors
        })
        .collect();
    if let Some(response) = batch_errors(errors) {
        return response;
    }

    let mut created: Vec<i64> = Vec::with_capacity(items.len());
    let mut body = Vec::with_capacity(items.len());
    for item in &items {
        let parent = item
            .new_parent
            .and_then(|index| created.get(index).copied())
            .or(item.exist_parent);
        let id = store.insert(item.name.as_deref().unwrap_or_default().trim(), parent);
        if let Some(tag) = store.tags.get_mut(&id) {
            tag.description = item.description.clone().unwrap_or_default();
        }
        created.push(id);

        let mut value = store.get(id).map(tag_value).unwrap_or(Value::Null);
        if let (Value::Object(map), Some(client_ref)) = (&mut value, &item.client_ref) {
            map.insert("client_ref".to_string(), Value::String(client_ref.clone()));
        }
        body.push(project(value, params.fields.as_deref()));
    }
    info!(count = created.len(), "tags created");
    (StatusCode::CREATED, Json(Value::Array(body))).into_response()
}

async fn update_tags(State(state): State<AppState>, Json(items): Json<Vec<UpdateTag>>) -> Response {
    let mut store = state.db.write().await;

    let errors: Vec<Map<String, Value>> = items
        .iter()
        .map(|item| {
            let mut errors = Map::new();
            if store.get(item.id).is_none() {
                field_error(&mut errors, NON_FIELD_ERRORS, format!("Tag {} does not exist.", item.id));
                return errors;
            }
            validate_name(&mut errors, item.name.as_deref(), false);
            if let Some(Some(parent)) = item.exist_parent {
                if store.get(parent).is_none() {
                    field_error(&mut errors, NON_FIELD_ERRORS, format!("Parent {parent} does not exist."));
                } else if store.subtree(item.id).contains(&parent) {
                    field_error(
                        &mut errors,
                        NON_FIELD_ERRORS,
                        "A tag cannot be moved under itself.".to_string(),
                    );
                }
            }
            errors
        })
        .collect();
    if let Some(response) = batch_errors(errors) {
        return response;
    }

    for item in items {
        let Some(tag) = store.tags.get_mut(&item.id) else {
            continue;
        };
        if let Some(name) = item.name {
            tag.name = name.trim().to_string();
        }
        if let Some(description) = item.description {
            tag.description = description;
        }
        if let Some(parent) = item.exist_parent {
            tag.parent = parent;
        }
    }
    (StatusCode::OK, Json(json!([]))).into_response()
}

/// Deleting a tag removes its whole subtree. Unknown ids are ignored.
async fn delete_tags(State(state): State<AppState>, Json(items): Json<Vec<DeleteTag>>) -> StatusCode {
    let mut store = state.db.write().await;
    let mut removed = 0;
    for item in items {
        if store.get(item.id).is_none() {
            continue;
        }
        for id in store.subtree(item.id) {
            if store.tags.remove(&id).is_some() {
                removed += 1;
            }
        }
    }
    info!(removed, "tags deleted");
    StatusCode::NO_CONTENT
}
