//! Pending add/edit/delete groups computed from an `EditableCollection`.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::record::{Fields, LocalKey, Record, RecordId};

/// Parent hint sent with an existing parent's identifier.
pub const EXIST_PARENT: &str = "exist_parent";
/// Parent hint pointing at a position in the same creation batch.
pub const NEW_PARENT: &str = "new_parent";
/// Client key echoed back by backends that support it.
pub const CLIENT_REF: &str = "client_ref";

/// Where a pending record hangs in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    Root,
    /// Parent is persisted under this identifier.
    Exist(RecordId),
    /// Parent is created in the same batch, at this index of `added`.
    New(usize),
}

/// Snapshot of one dirty record, taken when the change set was computed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub key: LocalKey,
    pub id: Option<RecordId>,
    pub fields: Fields,
    pub parent: ParentRef,
    /// Tree parent at snapshot time.
    pub parent_key: Option<LocalKey>,
}

impl PendingEntry {
    /// JSON body item: fields, identifier, parent hint and, for unpersisted
    /// records, the client reference.
    pub fn to_value(&self, id_field: &str) -> Value {
        let mut out = self.fields.clone();
        out.remove(EXIST_PARENT);
        out.remove(NEW_PARENT);
        match &self.id {
            Some(id) => {
                out.insert(id_field.to_string(), id.to_value());
            }
            None => {
                out.insert(CLIENT_REF.to_string(), Value::from(self.key.to_string()));
            }
        }
        match &self.parent {
            // A persisted record at the root says so explicitly, otherwise a
            // move to the root would not reach the server.
            ParentRef::Root if self.id.is_some() => {
                out.insert(EXIST_PARENT.to_string(), Value::Null);
            }
            ParentRef::Root => {}
            ParentRef::Exist(id) => {
                out.insert(EXIST_PARENT.to_string(), id.to_value());
            }
            ParentRef::New(index) => {
                out.insert(NEW_PARENT.to_string(), Value::from(*index));
            }
        }
        Value::Object(out)
    }
}

/// The three disjoint groups of unsaved work.
///
/// `added` keeps tree pre-order, so every `ParentRef::New(i)` points at an
/// earlier entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingChangeSet {
    pub added: Vec<PendingEntry>,
    pub edited: BTreeMap<RecordId, PendingEntry>,
    pub removed: BTreeMap<RecordId, Record>,
}

impl PendingChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.edited.is_empty() && self.removed.is_empty()
    }

    pub fn added_position(&self, key: LocalKey) -> Option<usize> {
        self.added.iter().position(|entry| entry.key == key)
    }

    pub fn contains(&self, key: LocalKey) -> bool {
        self.added_position(key).is_some()
            || self.edited.values().any(|entry| entry.key == key)
            || self.removed.values().any(|record| record.key == key)
    }
}

/// Body item for a removed record: its fields plus the identifier.
pub(crate) fn removed_value(record: &Record, id_field: &str) -> Value {
    let mut out = record.fields.clone();
    if let Some(id) = &record.id {
        out.insert(id_field.to_string(), id.to_value());
    }
    Value::Object(out)
}
