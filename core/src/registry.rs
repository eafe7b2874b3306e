//! Named option lists (select choices and the like) loaded once per session.
//!
//! The registry starts empty and unusable: `init` hands it the consumer to
//! load with, `teardown` drops the consumer and every cached list.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::consumer::{RequestConsumer, RequestDescriptor};
use crate::error::RegistryError;
use crate::http::HttpMethod;
use crate::query::{ListEnvelope, QueryParams};

#[derive(Debug, Clone, Default)]
pub struct OptionRegistry {
    consumer: Arc<RwLock<Option<RequestConsumer>>>,
    lists: Arc<RwLock<HashMap<String, Arc<Vec<Value>>>>>,
}

impl OptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn init(&self, consumer: RequestConsumer) {
        *self.consumer.write().await = Some(consumer);
        info!("option registry initialized");
    }

    /// Cached list for `name`, if loaded.
    pub async fn get(&self, name: &str) -> Option<Arc<Vec<Value>>> {
        self.lists.read().await.get(name).cloned()
    }

    /// Cached list for `name`, fetching it from `url` on first use.
    ///
    /// Concurrent first calls may both fetch; the first one stored wins and
    /// both callers get that list. Failures are not cached.
    pub async fn get_or_load(
        &self,
        name: &str,
        url: &str,
        query: QueryParams,
    ) -> Result<Arc<Vec<Value>>, RegistryError> {
        if let Some(list) = self.get(name).await {
            return Ok(list);
        }
        let consumer = self
            .consumer
            .read()
            .await
            .clone()
            .ok_or(RegistryError::NotInitialized)?;

        let outcome = consumer
            .start(RequestDescriptor::new(HttpMethod::Get, url).query(query))
            .await;
        if !outcome.is_success() {
            return Err(RegistryError::LoadFailed {
                name: name.to_string(),
                outcome: outcome.kind().to_string(),
                status: outcome.response().status,
            });
        }
        let rows = ListEnvelope::from_value(outcome.data())
            .map(|envelope| envelope.results)
            .unwrap_or_default();
        debug!(name, rows = rows.len(), "option list loaded");

        let mut lists = self.lists.write().await;
        Ok(Arc::clone(
            lists.entry(name.to_string()).or_insert_with(|| Arc::new(rows)),
        ))
    }

    /// Drop the cached list so the next `get_or_load` fetches it again.
    pub async fn invalidate(&self, name: &str) -> bool {
        self.lists.write().await.remove(name).is_some()
    }

    pub async fn teardown(&self) {
        self.lists.write().await.clear();
        *self.consumer.write().await = None;
        info!("option registry torn down");
    }
}
