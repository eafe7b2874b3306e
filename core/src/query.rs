//! Query parameters and the paginated list envelope.
//!
//! Parameters are passed through to the backend untouched; the core only
//! knows how to encode them onto a URL and how to read the
//! `count`/`results`/`next`/`previous` envelope back.

use std::fmt;

use serde_json::Value;
use url::Url;

use crate::error::TransportError;

/// One ordering key. Descending keys are sent with a `-` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub field: String,
    pub descending: bool,
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-{}", self.field)
        } else {
            f.write_str(&self.field)
        }
    }
}

/// Query string for list and projection requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    fields: Vec<String>,
    ordering: Vec<OrderKey>,
    page: Option<u32>,
    page_size: Option<u32>,
    search: Option<String>,
    extra: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the response to the given fields.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.ordering.push(OrderKey {
            field: field.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, field: impl Into<String>) -> Self {
        self.ordering.push(OrderKey {
            field: field.into(),
            descending: true,
        });
        self
    }

    /// Request one page. Pages are 1-based; `0` is bumped to `1`.
    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.page = Some(page.max(1));
        self.page_size = Some(page_size);
        self
    }

    pub fn search(mut self, keyword: impl Into<String>) -> Self {
        self.search = Some(keyword.into());
        self
    }

    /// Any other parameter the backend understands, passed as-is.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn page_number(&self) -> Option<u32> {
        self.page
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().is_empty()
    }

    /// Key/value pairs in a stable order.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if !self.fields.is_empty() {
            out.push(("fields".to_string(), self.fields.join(",")));
        }
        if !self.ordering.is_empty() {
            let keys: Vec<String> = self.ordering.iter().map(ToString::to_string).collect();
            out.push(("ordering".to_string(), keys.join(",")));
        }
        if let Some(page) = self.page {
            out.push(("page".to_string(), page.to_string()));
        }
        if let Some(size) = self.page_size {
            out.push(("page_size".to_string(), size.to_string()));
        }
        if let Some(search) = &self.search {
            out.push(("search".to_string(), search.clone()));
        }
        out.extend(self.extra.iter().cloned());
        out
    }

    /// Append the encoded parameters to `url`. The URL is returned unchanged
    /// when there is nothing to add.
    pub fn apply(&self, url: &str) -> Result<String, TransportError> {
        let pairs = self.pairs();
        if pairs.is_empty() {
            return Ok(url.to_string());
        }
        let mut parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        parsed
            .query_pairs_mut()
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Ok(parsed.into())
    }
}

/// A list response, either a bare JSON array or a paginated envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListEnvelope {
    pub count: Option<u64>,
    pub results: Vec<Value>,
    pub next: Option<String>,
    pub previous: Option<String>,
}

impl ListEnvelope {
    /// Returns `None` when the value is neither an array nor an object with a
    /// `results` array.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(items) => Some(Self {
                count: Some(items.len() as u64),
                results: items.clone(),
                next: None,
                previous: None,
            }),
            Value::Object(map) => {
                let results = map.get("results")?.as_array()?.clone();
                let link = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
                Some(Self {
                    count: map.get("count").and_then(Value::as_u64),
                    results,
                    next: link("next"),
                    previous: link("previous"),
                })
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}
