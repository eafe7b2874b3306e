//! In-memory editable tree (or flat list) of records with dirty tracking,
//! batched save and server-id reconciliation.
//!
//! # Design
//! Records live in a `HashMap` keyed by `LocalKey`; tree shape is kept as
//! ordered child-key lists plus a root list, so walking in pre-order always
//! visits a parent before its children. That ordering is what lets a dirty
//! child refer to an unpersisted parent by its index in `added`.
//!
//! A save is split into three steps that can also be driven by hand:
//! `prepare_save` builds the requests, the caller runs them, and the
//! `reconcile_after_*` methods fold the results back in. `save` does all of
//! it: POST and DELETE concurrently, then the PUT, which may depend on
//! identifiers minted by the POST.
//!
//! A flat list is the same collection with every record at the root.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::{debug, warn};

use crate::callbacks::{CallbackBundle, CallbackKind};
use crate::changeset::{
    removed_value, ParentRef, PendingChangeSet, PendingEntry, CLIENT_REF, EXIST_PARENT, NEW_PARENT,
};
use crate::consumer::{serialize, Outcome, RequestConsumer, RequestDescriptor};
use crate::error::CollectionError;
use crate::http::HttpMethod;
use crate::query::{ListEnvelope, QueryParams};
use crate::record::{FieldList, Fields, LocalKey, Record, RecordId, RecordSchema, RecordState};

type Result<T> = std::result::Result<T, CollectionError>;

/// Requests produced by `prepare_save`. `put` is only set when nothing is
/// being created; otherwise edits wait for the POST to resolve.
#[derive(Debug, Default)]
pub struct SavePlan {
    pub post: Option<RequestDescriptor>,
    pub put: Option<RequestDescriptor>,
    pub delete: Option<RequestDescriptor>,
}

impl SavePlan {
    pub fn is_empty(&self) -> bool {
        self.post.is_none() && self.put.is_none() && self.delete.is_none()
    }
}

#[derive(Debug)]
pub struct EditableCollection<S: RecordSchema = FieldList> {
    schema: S,
    records: HashMap<LocalKey, Record>,
    roots: Vec<LocalKey>,
    pending: PendingChangeSet,
}

impl<S: RecordSchema> EditableCollection<S> {
    pub fn new(schema: S) -> Self {
        Self {
            schema,
            records: HashMap::new(),
            roots: Vec::new(),
            pending: PendingChangeSet::default(),
        }
    }

    pub fn schema(&self) -> &S {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: LocalKey) -> Option<&Record> {
        self.records.get(&key)
    }

    pub fn roots(&self) -> &[LocalKey] {
        &self.roots
    }

    pub fn pending(&self) -> &PendingChangeSet {
        &self.pending
    }

    pub fn find_by_id(&self, id: &RecordId) -> Option<LocalKey> {
        self.records
            .values()
            .find(|record| record.id.as_ref() == Some(id))
            .map(|record| record.key)
    }

    /// All keys in pre-order: each parent before its children, siblings in
    /// position order.
    pub fn walk(&self) -> Vec<LocalKey> {
        let mut out = Vec::with_capacity(self.records.len());
        let mut stack: Vec<LocalKey> = self.roots.iter().rev().copied().collect();
        while let Some(key) = stack.pop() {
            out.push(key);
            if let Some(record) = self.records.get(&key) {
                stack.extend(record.children.iter().rev().copied());
            }
        }
        out
    }

    /// `key` and its descendants, in pre-order.
    fn subtree(&self, key: LocalKey) -> Result<Vec<LocalKey>> {
        if !self.records.contains_key(&key) {
            return Err(CollectionError::UnknownRecord(key));
        }
        let mut out = Vec::new();
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            out.push(k);
            if let Some(record) = self.records.get(&k) {
                stack.extend(record.children.iter().rev().copied());
            }
        }
        Ok(out)
    }

    fn siblings_mut(&mut self, parent: Option<LocalKey>) -> Result<&mut Vec<LocalKey>> {
        match parent {
            None => Ok(&mut self.roots),
            Some(p) => self
                .records
                .get_mut(&p)
                .map(|record| &mut record.children)
                .ok_or(CollectionError::UnknownRecord(p)),
        }
    }

    fn insert(&mut self, record: Record) -> Result<LocalKey> {
        let key = record.key;
        self.siblings_mut(record.parent)?.push(key);
        self.records.insert(key, record);
        Ok(key)
    }

    /// Add an unpersisted record at the root. It is dirty from the start.
    pub fn create_record(&mut self, initial: Fields) -> LocalKey {
        let record = Record::transient(initial, None);
        let key = record.key;
        self.roots.push(key);
        self.records.insert(key, record);
        key
    }

    /// Add an unpersisted record as the last child of `parent`.
    pub fn create_child(&mut self, parent: LocalKey, initial: Fields) -> Result<LocalKey> {
        self.insert(Record::transient(initial, Some(parent)))
    }

    fn record_from_row(&self, index: usize, row: &Value, parent: Option<LocalKey>) -> Result<Record> {
        let Value::Object(map) = row else {
            return Err(CollectionError::MissingIdentifier(index));
        };
        let id_field = self.schema.id_field();
        let id = map
            .get(id_field)
            .and_then(RecordId::from_value)
            .ok_or(CollectionError::MissingIdentifier(index))?;
        let mut fields = map.clone();
        fields.remove(id_field);
        Ok(Record::persisted(id, fields, parent))
    }

    /// Replace everything with server rows (a bare array or a paginated
    /// envelope). Pending groups are discarded.
    pub fn load(&mut self, rows: &Value) -> Result<Vec<LocalKey>> {
        let rows = list_rows(rows);
        let records = rows
            .iter()
            .enumerate()
            .map(|(i, row)| self.record_from_row(i, row, None))
            .collect::<Result<Vec<_>>>()?;
        self.records.clear();
        self.roots.clear();
        self.pending = PendingChangeSet::default();
        records.into_iter().map(|record| self.insert(record)).collect()
    }

    /// Replace the children of `parent` with server rows. Local records under
    /// the old children are dropped.
    pub fn load_children(&mut self, parent: LocalKey, rows: &Value) -> Result<Vec<LocalKey>> {
        let rows = list_rows(rows);
        let old_children = self
            .records
            .get(&parent)
            .ok_or(CollectionError::UnknownRecord(parent))?
            .children
            .clone();
        let mut dropped = Vec::new();
        for child in &old_children {
            dropped.extend(self.subtree(*child)?);
        }
        if let Some(busy) = dropped
            .iter()
            .find(|k| self.records.get(*k).map(Record::state) == Some(RecordState::Submitted))
        {
            return Err(CollectionError::InFlight(*busy));
        }
        let records = rows
            .iter()
            .enumerate()
            .map(|(i, row)| self.record_from_row(i, row, Some(parent)))
            .collect::<Result<Vec<_>>>()?;

        for key in &dropped {
            self.records.remove(key);
        }
        self.siblings_mut(Some(parent))?.clear();
        records.into_iter().map(|record| self.insert(record)).collect()
    }

    /// Replace everything with flat rows whose `parent_field` holds the
    /// parent's identifier (search results). Rows whose parent is not in the
    /// batch become roots, and so does the first record of any parent cycle.
    pub fn load_flat(&mut self, rows: &Value, parent_field: &str) -> Result<Vec<LocalKey>> {
        let rows = list_rows(rows);
        let mut records = Vec::with_capacity(rows.len());
        let mut parent_ids = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let mut record = self.record_from_row(i, row, None)?;
            parent_ids.push(record.fields.remove(parent_field).as_ref().and_then(RecordId::from_value));
            records.push(record);
        }
        let by_id: HashMap<RecordId, LocalKey> = records
            .iter()
            .filter_map(|r| r.id.clone().map(|id| (id, r.key)))
            .collect();
        for (record, parent_id) in records.iter_mut().zip(&parent_ids) {
            record.parent = parent_id
                .as_ref()
                .and_then(|id| by_id.get(id))
                .copied()
                .filter(|parent| *parent != record.key);
        }
        break_parent_cycles(&mut records);

        self.records.clear();
        self.roots.clear();
        self.pending = PendingChangeSet::default();
        let keys: Vec<LocalKey> = records.iter().map(|r| r.key).collect();
        for record in records {
            self.records.insert(record.key, record);
        }
        for key in &keys {
            let parent = self.records.get(key).and_then(|r| r.parent);
            self.siblings_mut(parent)?.push(*key);
        }
        Ok(keys)
    }

    /// Set one field. Persisted records become dirty or clean again depending
    /// on whether the schema's fields still differ from the origin.
    pub fn set_field(&mut self, key: LocalKey, name: &str, value: Value) -> Result<()> {
        let record = self
            .records
            .get_mut(&key)
            .ok_or(CollectionError::UnknownRecord(key))?;
        record.fields.insert(name.to_string(), value);
        if matches!(record.state, RecordState::Persisted | RecordState::Dirty) {
            record.state = if record.moved || self.schema.differs(&record.origin, &record.fields) {
                RecordState::Dirty
            } else {
                RecordState::Persisted
            };
        }
        Ok(())
    }

    /// Force a persisted record into the next save.
    pub fn mark_dirty(&mut self, key: LocalKey) -> Result<()> {
        let record = self
            .records
            .get_mut(&key)
            .ok_or(CollectionError::UnknownRecord(key))?;
        if record.state == RecordState::Persisted {
            record.state = RecordState::Dirty;
        }
        Ok(())
    }

    /// Move `key` under `new_parent` (root when `None`) at `position`,
    /// clamped to the sibling count. Persisted records become dirty.
    pub fn move_record(&mut self, key: LocalKey, new_parent: Option<LocalKey>, position: usize) -> Result<()> {
        let subtree = self.subtree(key)?;
        if let Some(p) = new_parent {
            if !self.records.contains_key(&p) {
                return Err(CollectionError::UnknownRecord(p));
            }
            if subtree.contains(&p) {
                return Err(CollectionError::CyclicMove(key));
            }
        }
        let old_parent = self.records.get(&key).and_then(|r| r.parent);
        self.siblings_mut(old_parent)?.retain(|k| *k != key);
        let siblings = self.siblings_mut(new_parent)?;
        let at = position.min(siblings.len());
        siblings.insert(at, key);

        if let Some(record) = self.records.get_mut(&key) {
            record.parent = new_parent;
            if record.is_persisted() && record.state != RecordState::PendingDelete {
                record.moved = true;
                record.state = RecordState::Dirty;
            }
        }
        Ok(())
    }

    /// Remove `key` and its subtree. Persisted records are queued in
    /// `removed`; unpersisted ones are dropped outright.
    pub fn remove_record(&mut self, key: LocalKey) -> Result<()> {
        let subtree = self.subtree(key)?;
        if let Some(busy) = subtree
            .iter()
            .find(|k| self.records.get(*k).map(Record::state) == Some(RecordState::Submitted))
        {
            return Err(CollectionError::InFlight(*busy));
        }
        let parent = self.records.get(&key).and_then(|r| r.parent);
        self.siblings_mut(parent)?.retain(|k| *k != key);

        let mut queued = 0;
        for k in subtree {
            let Some(mut record) = self.records.remove(&k) else {
                continue;
            };
            self.pending.added.retain(|entry| entry.key != k);
            if let Some(id) = record.id.clone() {
                self.pending.edited.remove(&id);
                record.state = RecordState::PendingDelete;
                record.children.clear();
                self.pending.removed.entry(id).or_insert(record);
                queued += 1;
            }
        }
        debug!(%key, queued, "removed record subtree");
        Ok(())
    }

    /// Rebuild `added` and `edited` from the dirty records. `removed` is kept.
    pub fn compute_change_set(&mut self) -> Result<&PendingChangeSet> {
        self.pending.added.clear();
        self.pending.edited.clear();

        for key in self.walk() {
            let Some(record) = self.records.get(&key) else {
                continue;
            };
            if !record.is_dirty() {
                continue;
            }
            let parent = match record.parent {
                None => ParentRef::Root,
                Some(pk) => {
                    let parent = self
                        .records
                        .get(&pk)
                        .ok_or(CollectionError::UnknownRecord(pk))?;
                    match &parent.id {
                        Some(id) => ParentRef::Exist(id.clone()),
                        None if parent.state == RecordState::Submitted => {
                            return Err(CollectionError::InFlight(pk));
                        }
                        None => match self.pending.added_position(pk) {
                            Some(index) => ParentRef::New(index),
                            None => {
                                return Err(CollectionError::ParentNotQueued { child: key, parent: pk });
                            }
                        },
                    }
                }
            };
            let entry = PendingEntry {
                key,
                id: record.id.clone(),
                fields: record.fields.clone(),
                parent,
                parent_key: record.parent,
            };
            match record.id.clone() {
                Some(id) => {
                    self.pending.edited.entry(id).or_insert(entry);
                }
                None => self.pending.added.push(entry),
            }
        }
        Ok(&self.pending)
    }

    /// Compute the change set and build the requests for it. Records queued
    /// for creation move to `Submitted` until reconciled or aborted.
    pub fn prepare_save(&mut self, endpoint: &str, callbacks: &CallbackBundle) -> Result<SavePlan> {
        self.compute_change_set()?;

        let id_field = self.schema.id_field().to_string();
        let mut post_fields: Vec<&str> = self.schema.field_names().iter().map(String::as_str).collect();
        post_fields.extend([EXIST_PARENT, NEW_PARENT, CLIENT_REF]);

        let post = serialize(
            self.pending.added.iter().map(|entry| entry.to_value(&id_field)),
            &post_fields,
        )
        .map(|body| {
            RequestDescriptor::new(HttpMethod::Post, endpoint)
                .body(body)
                .query(QueryParams::new().fields([id_field.as_str(), CLIENT_REF]))
                .callbacks(callbacks.clone())
        });
        let delete = serialize(
            self.pending.removed.values().map(|record| removed_value(record, &id_field)),
            &[id_field.as_str()],
        )
        .map(|body| {
            RequestDescriptor::new(HttpMethod::Delete, endpoint)
                .body(body)
                .callbacks(callbacks.clone())
        });
        let put = if post.is_none() {
            self.edit_request(endpoint, callbacks)
        } else {
            None
        };

        for entry in &self.pending.added {
            if let Some(record) = self.records.get_mut(&entry.key) {
                record.state = RecordState::Submitted;
            }
        }
        Ok(SavePlan { post, put, delete })
    }

    /// PUT for the `edited` group, or `None` if there is nothing to send.
    /// Entries still waiting on a `new_parent` are held back.
    pub fn edit_request(&self, endpoint: &str, callbacks: &CallbackBundle) -> Option<RequestDescriptor> {
        let id_field = self.schema.id_field();
        let mut allowed: Vec<&str> = vec![id_field];
        allowed.extend(self.schema.field_names().iter().map(String::as_str));
        allowed.push(EXIST_PARENT);

        let ready = self.pending.edited.values().filter(|entry| {
            let waiting = matches!(entry.parent, ParentRef::New(_));
            if waiting {
                warn!(key = %entry.key, "edit held back until its new parent is created");
            }
            !waiting
        });
        serialize(ready.map(|entry| entry.to_value(id_field)), &allowed).map(|body| {
            RequestDescriptor::new(HttpMethod::Put, endpoint)
                .body(body)
                .callbacks(callbacks.clone())
        })
    }

    /// Submit all pending work to `endpoint`. Returns `true` when there was
    /// nothing to save. Every request fires `callbacks`.
    pub async fn save(
        &mut self,
        consumer: &RequestConsumer,
        endpoint: &str,
        callbacks: &CallbackBundle,
    ) -> Result<bool> {
        let mut callbacks = CallbackBundle::copy_with(Some(callbacks), &[CallbackKind::Succeed]);
        callbacks.on(CallbackKind::Succeed, |args| {
            debug!(method = %args.request.method, status = args.response.status, "batch accepted");
        });

        let plan = self.prepare_save(endpoint, &callbacks)?;
        if plan.is_empty() {
            debug!(endpoint, "nothing to save");
            return Ok(true);
        }
        let SavePlan { post, put, delete } = plan;
        let (first, removed) = tokio::join!(run(consumer, post.or(put)), run(consumer, delete));

        if let Some((_, outcome)) = removed {
            if outcome.is_success() {
                self.reconcile_after_delete();
            }
        }
        match first {
            Some((HttpMethod::Post, outcome)) => {
                if !outcome.is_success() {
                    self.abort_submission();
                    return Ok(false);
                }
                if let Err(e) = self.reconcile_after_create(outcome.data()) {
                    warn!(error = %e, "cannot reconcile created records");
                    self.abort_submission();
                    return Err(e);
                }
                if let Some(put) = self.edit_request(endpoint, &callbacks) {
                    if consumer.start(put).await.is_success() {
                        self.reconcile_after_edit();
                    }
                }
            }
            Some((_, outcome)) => {
                if outcome.is_success() {
                    self.reconcile_after_edit();
                }
            }
            None => {}
        }
        Ok(false)
    }

    /// Fold the identifiers returned by a successful POST into the submitted
    /// records, then point edited records that waited on a `new_parent` at
    /// the new identifier.
    ///
    /// Rows are matched by `client_ref` when every row echoes one, otherwise
    /// by position, which relies on the server keeping submission order.
    pub fn reconcile_after_create(&mut self, created: &Value) -> Result<()> {
        let rows = list_rows(created);
        let submitted = self.pending.added.len();
        if rows.len() != submitted {
            return Err(CollectionError::CreatedCountMismatch {
                submitted,
                returned: rows.len(),
            });
        }

        let id_field = self.schema.id_field();
        let by_ref = !rows.is_empty()
            && rows
                .iter()
                .all(|row| row.get(CLIENT_REF).and_then(Value::as_str).is_some());
        let mut assigned: Vec<Option<RecordId>> = vec![None; submitted];
        for (pos, row) in rows.iter().enumerate() {
            let index = if by_ref {
                let raw = row.get(CLIENT_REF).and_then(Value::as_str).unwrap_or_default();
                raw.parse::<LocalKey>()
                    .ok()
                    .and_then(|key| self.pending.added_position(key))
                    .ok_or_else(|| CollectionError::UnknownClientRef(raw.to_string()))?
            } else {
                pos
            };
            let id = row
                .get(id_field)
                .and_then(RecordId::from_value)
                .ok_or(CollectionError::MissingIdentifier(pos))?;
            assigned[index] = Some(id);
        }
        let ids = assigned
            .into_iter()
            .enumerate()
            .map(|(i, id)| id.ok_or(CollectionError::MissingIdentifier(i)))
            .collect::<Result<Vec<_>>>()?;

        for (entry, id) in self.pending.added.iter().zip(&ids) {
            let Some(record) = self.records.get_mut(&entry.key) else {
                warn!(key = %entry.key, %id, "created record no longer in collection");
                continue;
            };
            record.id = Some(id.clone());
            settle(record, entry);
        }
        for entry in self.pending.edited.values_mut() {
            if let ParentRef::New(index) = entry.parent {
                if let Some(id) = ids.get(index) {
                    entry.parent = ParentRef::Exist(id.clone());
                }
            }
        }
        debug!(created = ids.len(), "reconciled created records");
        self.pending.added.clear();
        Ok(())
    }

    /// Mark the records of a successful PUT as persisted.
    pub fn reconcile_after_edit(&mut self) {
        for entry in std::mem::take(&mut self.pending.edited).into_values() {
            if let Some(record) = self.records.get_mut(&entry.key) {
                settle(record, &entry);
            }
        }
    }

    /// Forget the `removed` group after a successful DELETE.
    pub fn reconcile_after_delete(&mut self) {
        self.pending.removed.clear();
    }

    /// Return records of a failed POST to `Transient` so the next save
    /// submits them again.
    pub fn abort_submission(&mut self) {
        for entry in std::mem::take(&mut self.pending.added) {
            if let Some(record) = self.records.get_mut(&entry.key) {
                if record.state == RecordState::Submitted {
                    record.state = RecordState::Transient;
                }
            }
        }
    }
}

/// The submitted snapshot becomes the origin. The record is clean only if it
/// has not changed since the snapshot was taken.
fn settle(record: &mut Record, entry: &PendingEntry) {
    if record.fields == entry.fields && record.parent == entry.parent_key {
        record.commit();
    } else {
        record.origin = entry.fields.clone();
        record.state = RecordState::Dirty;
    }
}

/// Detach records whose parent chain leads back to themselves. Each cycle
/// loses one link, at the first member in row order.
fn break_parent_cycles(records: &mut [Record]) {
    let mut parent_of: HashMap<LocalKey, LocalKey> = records
        .iter()
        .filter_map(|r| r.parent.map(|p| (r.key, p)))
        .collect();
    for record in records.iter_mut() {
        let mut seen = HashSet::new();
        let mut cursor = parent_of.get(&record.key).copied();
        while let Some(ancestor) = cursor {
            if ancestor == record.key {
                warn!(key = %record.key, id = ?record.id, "parent cycle in flat rows, record moved to the root");
                record.parent = None;
                parent_of.remove(&record.key);
                break;
            }
            if !seen.insert(ancestor) {
                break;
            }
            cursor = parent_of.get(&ancestor).copied();
        }
    }
}

fn list_rows(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => ListEnvelope::from_value(other)
            .map(|envelope| envelope.results)
            .unwrap_or_default(),
    }
}

async fn run(consumer: &RequestConsumer, request: Option<RequestDescriptor>) -> Option<(HttpMethod, Outcome)> {
    let request = request?;
    let method = request.method;
    Some((method, consumer.start(request).await))
}
