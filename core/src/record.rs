//! Client-side record model.
//!
//! # Design
//! A `Record` is owned by exactly one `EditableCollection`. Tree links are
//! stored as `LocalKey`s rather than references, so the collection can hand
//! out `&Record` freely and move nodes without fighting ownership cycles.
//! The server identifier is optional: `None` means the record was never
//! persisted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Field values of a record, keyed by field name.
pub type Fields = Map<String, Value>;

/// Client-generated key, stable for the lifetime of a record in memory.
///
/// Also sent to the backend as `client_ref` with creation requests so the
/// server can echo it back next to the identifier it assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalKey(Uuid);

impl LocalKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LocalKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LocalKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Server-assigned identifier. Backends hand out either integers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Str(String),
}

impl RecordId {
    /// Read an identifier out of a JSON value. `null`, empty strings and
    /// non-scalar values count as "no identifier".
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RecordId::Int),
            Value::String(s) if !s.is_empty() => Some(RecordId::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RecordId::Int(n) => Value::from(*n),
            RecordId::Str(s) => Value::from(s.as_str()),
        }
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        RecordId::Int(n)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::Str(s.to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{n}"),
            RecordId::Str(s) => f.write_str(s),
        }
    }
}

/// Lifecycle of a record on the client.
///
/// `Transient -> Submitted -> Persisted <-> Dirty -> PendingDelete`. A failed
/// creation request sends `Submitted` back to `Transient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordState {
    /// Created locally, no identifier yet.
    Transient,
    /// Part of a creation request that has not resolved.
    Submitted,
    /// Matches the last state known to the server.
    Persisted,
    /// Persisted, with local changes not yet saved.
    Dirty,
    /// Removed locally, deletion not yet confirmed by the server.
    PendingDelete,
}

/// One editable entity held client-side.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub(crate) key: LocalKey,
    pub(crate) id: Option<RecordId>,
    pub(crate) fields: Fields,
    pub(crate) origin: Fields,
    pub(crate) state: RecordState,
    pub(crate) parent: Option<LocalKey>,
    pub(crate) children: Vec<LocalKey>,
    pub(crate) moved: bool,
}

impl Record {
    pub(crate) fn transient(fields: Fields, parent: Option<LocalKey>) -> Self {
        Self {
            key: LocalKey::new(),
            id: None,
            fields,
            origin: Fields::new(),
            state: RecordState::Transient,
            parent,
            children: Vec::new(),
            moved: false,
        }
    }

    pub(crate) fn persisted(id: RecordId, fields: Fields, parent: Option<LocalKey>) -> Self {
        Self {
            key: LocalKey::new(),
            id: Some(id),
            origin: fields.clone(),
            fields,
            state: RecordState::Persisted,
            parent,
            children: Vec::new(),
            moved: false,
        }
    }

    pub fn key(&self) -> LocalKey {
        self.key
    }

    pub fn id(&self) -> Option<&RecordId> {
        self.id.as_ref()
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Field values as last confirmed by the server.
    pub fn origin(&self) -> &Fields {
        &self.origin
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn parent(&self) -> Option<LocalKey> {
        self.parent
    }

    pub fn children(&self) -> &[LocalKey] {
        &self.children
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Whether the record has to be part of the next save.
    pub fn is_dirty(&self) -> bool {
        matches!(self.state, RecordState::Transient | RecordState::Dirty)
    }

    /// Mark the current values as the server's values.
    pub(crate) fn commit(&mut self) {
        self.origin = self.fields.clone();
        self.moved = false;
        self.state = RecordState::Persisted;
    }
}

/// Per-record-type description of the editable fields.
///
/// Each concrete form (tags, roles, quotas, ...) implements this instead of
/// sharing a base class: it names the fields that are submitted and diffed,
/// and may normalize raw input before comparison.
pub trait RecordSchema {
    /// Names of the editable fields, in submission order.
    fn field_names(&self) -> &[String];

    /// Name of the identifier field in request and response bodies.
    fn id_field(&self) -> &str {
        "id"
    }

    /// Normalize a value before comparing it with the origin. Identity by
    /// default.
    fn normalize(&self, _field: &str, value: &Value) -> Value {
        value.clone()
    }

    /// Whether `current` differs from `origin` on any editable field.
    fn differs(&self, origin: &Fields, current: &Fields) -> bool {
        self.field_names().iter().any(|name| {
            let before = origin.get(name).unwrap_or(&Value::Null);
            let after = current.get(name).unwrap_or(&Value::Null);
            self.normalize(name, before) != self.normalize(name, after)
        })
    }
}

/// Schema made of a plain list of field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldList {
    id_field: String,
    fields: Vec<String>,
}

impl FieldList {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id_field: "id".to_string(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }
}

impl RecordSchema for FieldList {
    fn field_names(&self) -> &[String] {
        &self.fields
    }

    fn id_field(&self) -> &str {
        &self.id_field
    }
}
