//! Scripted transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::transport::Transport;

type Reply = Result<HttpResponse, TransportError>;

/// Answers requests from per-method queues and records everything it sees.
///
/// Queues are keyed by method so concurrent POST and DELETE requests get
/// deterministic answers regardless of polling order. An exhausted queue
/// answers 500.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    replies: Mutex<HashMap<HttpMethod, VecDeque<Reply>>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(self, method: HttpMethod, status: u16, body: &str) -> Self {
        self.push(
            method,
            Ok(HttpResponse {
                status,
                headers: Vec::new(),
                body: body.to_string(),
            }),
        );
        self
    }

    pub(crate) fn fail(self, method: HttpMethod, message: &str) -> Self {
        self.push(method, Err(TransportError::Network(message.to_string())));
        self
    }

    fn push(&self, method: HttpMethod, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub(crate) fn requests_with(&self, method: HttpMethod) -> Vec<HttpRequest> {
        self.requests().into_iter().filter(|r| r.method == method).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        let next = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&request.method)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| {
            Ok(HttpResponse {
                status: 500,
                headers: Vec::new(),
                body: r#"{"detail": "script exhausted"}"#.to_string(),
            })
        })
    }
}
