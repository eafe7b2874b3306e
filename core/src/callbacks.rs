//! Named callback lists fired by `RequestConsumer`.
//!
//! # Design
//! A bundle holds one ordered list per `CallbackKind`. Every finished request
//! fires exactly one list, and each callback in it runs once, in registration
//! order. Callbacks are `Arc`s so a bundle can be cloned cheaply and extended
//! without touching the caller's copy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::consumer::{RequestDescriptor, ResponseMeta};

/// The four outcomes a request can be reported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Succeed,
    UnhandledErrorResponse,
    UnhandledException,
    ServerBusy,
}

impl CallbackKind {
    pub const ALL: [CallbackKind; 4] = [
        CallbackKind::Succeed,
        CallbackKind::UnhandledErrorResponse,
        CallbackKind::UnhandledException,
        CallbackKind::ServerBusy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Succeed => "succeed",
            CallbackKind::UnhandledErrorResponse => "unhandled_error_response",
            CallbackKind::UnhandledException => "unhandled_exception",
            CallbackKind::ServerBusy => "server_busy",
        }
    }
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a callback receives: parsed body (or `null`), response metadata and
/// the descriptor that produced the request.
pub struct CallbackArgs<'a> {
    pub data: &'a Value,
    pub response: &'a ResponseMeta,
    pub request: &'a RequestDescriptor,
}

pub type Callback = Arc<dyn Fn(&CallbackArgs<'_>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct CallbackBundle {
    lists: HashMap<CallbackKind, Vec<Callback>>,
}

impl CallbackBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a callback to the list for `kind`.
    pub fn on<F>(&mut self, kind: CallbackKind, callback: F) -> &mut Self
    where
        F: Fn(&CallbackArgs<'_>) + Send + Sync + 'static,
    {
        self.lists.entry(kind).or_default().push(Arc::new(callback));
        self
    }

    /// Builder form of `on`.
    pub fn with<F>(mut self, kind: CallbackKind, callback: F) -> Self
    where
        F: Fn(&CallbackArgs<'_>) + Send + Sync + 'static,
    {
        self.on(kind, callback);
        self
    }

    pub fn len(&self, kind: CallbackKind) -> usize {
        self.lists.get(&kind).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.lists.values().all(Vec::is_empty)
    }

    /// Shallow copy of `origin` in which every kind in `kinds` owns its own
    /// list, so callers can append internal callbacks to the copy. A missing
    /// origin yields empty lists.
    pub fn copy_with(origin: Option<&CallbackBundle>, kinds: &[CallbackKind]) -> CallbackBundle {
        let mut copied = origin.cloned().unwrap_or_default();
        for kind in kinds {
            copied.lists.entry(*kind).or_default();
        }
        copied
    }

    /// Run every callback registered for `kind`. Returns how many ran.
    pub fn fire(&self, kind: CallbackKind, args: &CallbackArgs<'_>) -> usize {
        let Some(list) = self.lists.get(&kind) else {
            return 0;
        };
        for callback in list {
            callback(args);
        }
        list.len()
    }
}

impl fmt::Debug for CallbackBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in CallbackKind::ALL {
            map.entry(&kind.as_str(), &self.len(kind));
        }
        map.finish()
    }
}
