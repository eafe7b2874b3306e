//! Client-side sync core for REST-backed editable collections.
//!
//! # Overview
//! Two pieces sit between a user interface and a JSON REST backend:
//! `RequestConsumer` issues single requests, retries rate-limited ones and
//! reports every outcome through typed callbacks; `EditableCollection` keeps
//! a tree (or flat list) of records, tracks what changed and turns the
//! changes into batched create/update/delete requests.
//!
//! # Design
//! - The network sits behind the `Transport` trait. `ReqwestTransport` is the
//!   production implementation; tests script replies per method.
//! - Record types describe themselves through `RecordSchema` instead of
//!   inheriting from a shared form base.
//! - Tree links are `LocalKey`s into a map owned by the collection, never
//!   references, so nodes can move freely.
//! - Nothing here holds global state. Option lists are cached in an
//!   explicit `OptionRegistry`.

pub mod callbacks;
pub mod changeset;
pub mod collection;
pub mod config;
pub mod consumer;
pub mod csrf;
pub mod error;
pub mod http;
pub mod query;
pub mod record;
pub mod registry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use callbacks::{CallbackArgs, CallbackBundle, CallbackKind};
pub use changeset::{ParentRef, PendingChangeSet, PendingEntry};
pub use collection::{EditableCollection, SavePlan};
pub use config::ConsumerConfig;
pub use consumer::{serialize, Outcome, RequestConsumer, RequestDescriptor, ResponseMeta};
pub use csrf::{CookieJar, CsrfConfig};
pub use error::{CollectionError, RegistryError, TransportError};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use query::{ListEnvelope, QueryParams};
pub use record::{FieldList, Fields, LocalKey, Record, RecordId, RecordSchema, RecordState};
pub use registry::OptionRegistry;
pub use transport::{ReqwestTransport, Transport};
