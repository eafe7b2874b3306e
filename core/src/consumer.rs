//! Single-request API consumer with 429 retry and typed callbacks.
//!
//! # Design
//! `RequestConsumer` owns no per-request state: everything a request needs
//! (target, body, callbacks, retry budget) travels in a `RequestDescriptor`
//! that `start` consumes. The response is classified into one of four
//! outcomes, the matching callback list fires exactly once, and the same
//! `Outcome` is returned so async callers can branch on it directly.
//!
//! Rate limiting is the only failure retried automatically. Retries reissue
//! the identical `HttpRequest` after a fixed backoff and are invisible to the
//! callbacks.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::callbacks::{CallbackArgs, CallbackBundle, CallbackKind};
use crate::config::ConsumerConfig;
use crate::csrf::CookieJar;
use crate::error::TransportError;
use crate::http::{HttpMethod, HttpRequest};
use crate::query::QueryParams;
use crate::transport::Transport;

/// Key for record-level (non-field) error messages in error bodies.
pub const NON_FIELD_ERRORS: &str = "non_field_errors";

const TOO_MANY_REQUESTS: u16 = 429;

/// Everything needed to issue one request. Consumed by `RequestConsumer::start`.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub query: QueryParams,
    pub callbacks: CallbackBundle,
    /// Overrides the consumer's configured retry budget.
    pub retry_budget: Option<u32>,
    /// Overrides the consumer's configured backoff.
    pub backoff: Option<Duration>,
    /// Caller data carried through to the callbacks untouched.
    pub extra: Value,
}

impl RequestDescriptor {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            query: QueryParams::default(),
            callbacks: CallbackBundle::default(),
            retry_budget: None,
            backoff: None,
            extra: Value::Null,
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, query: QueryParams) -> Self {
        self.query = query;
        self
    }

    pub fn callbacks(mut self, callbacks: CallbackBundle) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Render the wire request: query string encoded onto the URL, JSON
    /// content type added when there is a body.
    pub fn to_http(&self) -> Result<HttpRequest, TransportError> {
        let url = self.query.apply(&self.url)?;
        let mut headers = self.headers.clone();
        if self.body.is_some() && !self.has_header("content-type") {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }
        Ok(HttpRequest {
            method: self.method,
            url,
            headers,
            body: self.body.clone(),
        })
    }
}

/// Response metadata handed to callbacks next to the parsed body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// HTTP status, or `0` when no response arrived.
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Attempts made, including 429 retries.
    pub attempts: u32,
    /// Message of the failure behind an `unhandled_exception`.
    pub exception: Option<String>,
}

/// Remaining 429 retries and the wait between them, for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub remaining: u32,
    pub backoff: Duration,
}

impl RetryState {
    pub fn new(remaining: u32, backoff: Duration) -> Self {
        Self { remaining, backoff }
    }

    /// Take one retry from the budget. `false` once it is spent.
    pub fn consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// How a request ended. Mirrors `CallbackKind`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeed { data: Value, response: ResponseMeta },
    ErrorResponse { data: Value, response: ResponseMeta },
    Exception { data: Value, response: ResponseMeta },
    ServerBusy { response: ResponseMeta },
}

static NULL: Value = Value::Null;

impl Outcome {
    pub fn kind(&self) -> CallbackKind {
        match self {
            Outcome::Succeed { .. } => CallbackKind::Succeed,
            Outcome::ErrorResponse { .. } => CallbackKind::UnhandledErrorResponse,
            Outcome::Exception { .. } => CallbackKind::UnhandledException,
            Outcome::ServerBusy { .. } => CallbackKind::ServerBusy,
        }
    }

    pub fn data(&self) -> &Value {
        match self {
            Outcome::Succeed { data, .. }
            | Outcome::ErrorResponse { data, .. }
            | Outcome::Exception { data, .. } => data,
            Outcome::ServerBusy { .. } => &NULL,
        }
    }

    pub fn response(&self) -> &ResponseMeta {
        match self {
            Outcome::Succeed { response, .. }
            | Outcome::ErrorResponse { response, .. }
            | Outcome::Exception { response, .. }
            | Outcome::ServerBusy { response } => response,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeed { .. })
    }
}

/// Issues requests through a `Transport` and reports them via callbacks.
#[derive(Clone)]
pub struct RequestConsumer {
    transport: Arc<dyn Transport>,
    config: ConsumerConfig,
    cookies: CookieJar,
}

impl fmt::Debug for RequestConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestConsumer")
            .field("config", &self.config)
            .field("cookies", &self.cookies)
            .finish_non_exhaustive()
    }
}

impl RequestConsumer {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::with_config(transport, ConsumerConfig::default())
    }

    pub fn with_config<T: Transport + 'static>(transport: T, config: ConsumerConfig) -> Self {
        Self::from_shared(Arc::new(transport), config)
    }

    pub fn from_shared(transport: Arc<dyn Transport>, config: ConsumerConfig) -> Self {
        Self {
            transport,
            config,
            cookies: CookieJar::default(),
        }
    }

    /// Cookies used to resolve the CSRF header.
    pub fn cookies(mut self, cookies: CookieJar) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Issue the request, retrying on 429 while the budget lasts, then fire
    /// the callback list matching the outcome.
    pub async fn start(&self, mut request: RequestDescriptor) -> Outcome {
        self.attach_csrf(&mut request);
        let mut retry = RetryState::new(
            request.retry_budget.unwrap_or(self.config.retry_budget),
            request.backoff.unwrap_or_else(|| self.config.backoff()),
        );

        let http = match request.to_http() {
            Ok(http) => http,
            Err(e) => {
                error!(method = %request.method, url = %request.url, error = %e, "cannot build request");
                let outcome = exception(&e.to_string(), 0, 0);
                return self.finish(&request, outcome);
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            debug!(method = %http.method, url = %http.url, attempt = attempts, "sending request");

            let response = match self.transport.execute(&http).await {
                Ok(response) => response,
                Err(e) => {
                    error!(method = %http.method, url = %http.url, error = %e, "transport failure");
                    let outcome = exception(&e.to_string(), 0, attempts);
                    return self.finish(&request, outcome);
                }
            };

            if response.status == TOO_MANY_REQUESTS {
                if retry.consume() {
                    warn!(
                        url = %http.url,
                        remaining = retry.remaining,
                        backoff_ms = retry.backoff.as_millis() as u64,
                        "rate limited, retrying"
                    );
                    tokio::time::sleep(retry.backoff).await;
                    continue;
                }
                warn!(url = %http.url, attempts, "still rate limited after all retries");
                let meta = ResponseMeta {
                    status: response.status,
                    headers: response.headers,
                    attempts,
                    exception: None,
                };
                return self.finish(&request, Outcome::ServerBusy { response: meta });
            }

            let meta = ResponseMeta {
                status: response.status,
                headers: response.headers,
                attempts,
                exception: None,
            };

            let outcome = if meta.status >= 400 {
                let data = parse_body(&response.body).unwrap_or(Value::Null);
                Outcome::ErrorResponse { data, response: meta }
            } else {
                match parse_body(&response.body) {
                    Ok(data) => Outcome::Succeed { data, response: meta },
                    Err(e) => {
                        error!(url = %http.url, status = meta.status, error = %e, "response body is not JSON");
                        exception(&e.to_string(), meta.status, attempts)
                    }
                }
            };
            return self.finish(&request, outcome);
        }
    }

    fn attach_csrf(&self, request: &mut RequestDescriptor) {
        if !request.method.is_unsafe() {
            return;
        }
        match self.cookies.csrf_header(&self.config.csrf) {
            Some((name, token)) => {
                if !request.has_header(&name) {
                    request.headers.push((name, token));
                }
            }
            None => warn!(method = %request.method, url = %request.url, "CSRF token not found in cookies"),
        }
    }

    fn finish(&self, request: &RequestDescriptor, outcome: Outcome) -> Outcome {
        let kind = outcome.kind();
        let fired = request.callbacks.fire(
            kind,
            &CallbackArgs {
                data: outcome.data(),
                response: outcome.response(),
                request,
            },
        );
        debug!(
            method = %request.method,
            url = %request.url,
            outcome = %kind,
            status = outcome.response().status,
            callbacks = fired,
            "request finished"
        );
        outcome
    }

    /// See [`serialize`].
    pub fn serialize<I>(records: I, allowed_fields: &[&str]) -> Option<String>
    where
        I: IntoIterator,
        I::Item: Borrow<Value>,
    {
        serialize(records, allowed_fields)
    }
}

fn parse_body(body: &str) -> Result<Value, serde_json::Error> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body)
}

fn exception(message: &str, status: u16, attempts: u32) -> Outcome {
    Outcome::Exception {
        data: json!([{ NON_FIELD_ERRORS: [message] }]),
        response: ResponseMeta {
            status,
            headers: Vec::new(),
            attempts,
            exception: Some(message.to_string()),
        },
    }
}

/// Keep only `allowed_fields` of each record and encode the list as a JSON
/// array. Returns `None` for an empty list, which callers use to skip the
/// request altogether. Non-object items encode as `{}`.
pub fn serialize<I>(records: I, allowed_fields: &[&str]) -> Option<String>
where
    I: IntoIterator,
    I::Item: Borrow<Value>,
{
    let picked: Vec<Value> = records
        .into_iter()
        .map(|record| {
            let mut out = Map::new();
            if let Value::Object(fields) = record.borrow() {
                for (key, value) in fields {
                    if allowed_fields.contains(&key.as_str()) {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(out)
        })
        .collect();
    if picked.is_empty() {
        return None;
    }
    serde_json::to_string(&picked).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use std::sync::Mutex;

    fn consumer(transport: &Arc<ScriptedTransport>) -> RequestConsumer {
        RequestConsumer::from_shared(transport.clone(), ConsumerConfig::default())
    }

    /// Bundle that records which kinds fired, in order.
    fn recording() -> (CallbackBundle, Arc<Mutex<Vec<CallbackKind>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bundle = CallbackBundle::new();
        for kind in CallbackKind::ALL {
            let seen = Arc::clone(&seen);
            bundle.on(kind, move |_| seen.lock().unwrap().push(kind));
        }
        (bundle, seen)
    }

    fn get(url: &str) -> RequestDescriptor {
        RequestDescriptor::new(HttpMethod::Get, url)
    }

    #[test]
    fn serialize_empty_is_none() {
        let empty: Vec<Value> = Vec::new();
        assert_eq!(serialize(&empty, &["name"]), None);
    }

    #[test]
    fn serialize_drops_fields_not_allowed() {
        let records = vec![json!({"id": 1, "name": "a"})];
        assert_eq!(serialize(&records, &["name"]).as_deref(), Some(r#"[{"name":"a"}]"#));
        assert_eq!(
            RequestConsumer::serialize(&records, &[]).as_deref(),
            Some("[{}]")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limit_then_succeeds() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(HttpMethod::Get, 429, "")
                .reply(HttpMethod::Get, 429, "")
                .reply(HttpMethod::Get, 200, r#"[{"id": 1}]"#),
        );
        let (bundle, seen) = recording();
        let started = tokio::time::Instant::now();

        let outcome = consumer(&transport)
            .start(get("http://api.test/tags").retry_budget(2).callbacks(bundle))
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.data(), &json!([{"id": 1}]));
        assert_eq!(outcome.response().attempts, 3);
        assert_eq!(*seen.lock().unwrap(), vec![CallbackKind::Succeed]);
        assert_eq!(transport.requests().len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(2 * 240));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_reports_server_busy() {
        let transport = Arc::new(ScriptedTransport::new().reply(HttpMethod::Get, 429, ""));
        let (bundle, seen) = recording();

        let outcome = consumer(&transport)
            .start(get("http://api.test/tags").retry_budget(0).callbacks(bundle))
            .await;

        assert!(matches!(outcome, Outcome::ServerBusy { .. }));
        assert_eq!(*seen.lock().unwrap(), vec![CallbackKind::ServerBusy]);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_reissue_identical_request() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(HttpMethod::Put, 429, "")
                .reply(HttpMethod::Put, 200, "[]"),
        );
        let req = RequestDescriptor::new(HttpMethod::Put, "http://api.test/tags").body(r#"[{"id":1}]"#);
        consumer(&transport).start(req).await;

        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[tokio::test]
    async fn error_status_passes_parsed_body() {
        let transport = Arc::new(
            ScriptedTransport::new().reply(HttpMethod::Get, 400, r#"{"name": ["This field is required."]}"#),
        );
        let captured = Arc::new(Mutex::new(Value::Null));
        let sink = Arc::clone(&captured);
        let bundle = CallbackBundle::new().with(CallbackKind::UnhandledErrorResponse, move |args| {
            *sink.lock().unwrap() = args.data.clone();
        });

        let outcome = consumer(&transport).start(get("http://api.test/tags").callbacks(bundle)).await;

        assert_eq!(outcome.kind(), CallbackKind::UnhandledErrorResponse);
        assert_eq!(outcome.response().status, 400);
        assert_eq!(*captured.lock().unwrap(), json!({"name": ["This field is required."]}));
    }

    #[tokio::test]
    async fn server_error_with_html_body_gives_null_data() {
        let transport = Arc::new(ScriptedTransport::new().reply(HttpMethod::Get, 502, "<html>bad gateway</html>"));
        let outcome = consumer(&transport).start(get("http://api.test/tags")).await;
        assert_eq!(outcome.kind(), CallbackKind::UnhandledErrorResponse);
        assert_eq!(outcome.data(), &Value::Null);
    }

    #[tokio::test]
    async fn transport_failure_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new().fail(HttpMethod::Get, "connection refused"));
        let (bundle, seen) = recording();

        let outcome = consumer(&transport).start(get("http://api.test/tags").callbacks(bundle)).await;

        assert_eq!(*seen.lock().unwrap(), vec![CallbackKind::UnhandledException]);
        assert_eq!(outcome.response().status, 0);
        assert_eq!(transport.requests().len(), 1);
        let message = outcome.data()[0][NON_FIELD_ERRORS][0].as_str().unwrap();
        assert!(message.contains("connection refused"));
    }

    #[tokio::test]
    async fn success_with_invalid_json_is_an_exception() {
        let transport = Arc::new(ScriptedTransport::new().reply(HttpMethod::Get, 200, "not json"));
        let outcome = consumer(&transport).start(get("http://api.test/tags")).await;
        assert_eq!(outcome.kind(), CallbackKind::UnhandledException);
        assert_eq!(outcome.response().status, 200);
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let transport = Arc::new(ScriptedTransport::new().reply(HttpMethod::Delete, 204, ""));
        let outcome = consumer(&transport)
            .start(RequestDescriptor::new(HttpMethod::Delete, "http://api.test/tags").body("[]"))
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.data(), &Value::Null);
    }

    #[tokio::test]
    async fn invalid_url_is_reported_as_exception() {
        let transport = Arc::new(ScriptedTransport::new());
        let req = get("not a url").query(QueryParams::new().search("x"));
        let outcome = consumer(&transport).start(req).await;
        assert_eq!(outcome.kind(), CallbackKind::UnhandledException);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn callbacks_receive_original_descriptor() {
        let transport = Arc::new(ScriptedTransport::new().reply(HttpMethod::Get, 200, "{}"));
        let captured = Arc::new(Mutex::new(Value::Null));
        let sink = Arc::clone(&captured);
        let bundle = CallbackBundle::new().with(CallbackKind::Succeed, move |args| {
            *sink.lock().unwrap() = args.request.extra.clone();
        });
        let req = get("http://api.test/tags")
            .extra(json!({"node_key_path": [0, 2]}))
            .callbacks(bundle);

        consumer(&transport).start(req).await;

        assert_eq!(*captured.lock().unwrap(), json!({"node_key_path": [0, 2]}));
    }

    #[tokio::test]
    async fn query_params_are_encoded_on_the_url() {
        let transport = Arc::new(ScriptedTransport::new().reply(HttpMethod::Get, 200, "[]"));
        let req = get("http://api.test/tags").query(QueryParams::new().fields(["id", "name"]).order_by_desc("name"));
        consumer(&transport).start(req).await;
        assert_eq!(
            transport.requests()[0].url,
            "http://api.test/tags?fields=id%2Cname&ordering=-name"
        );
    }

    fn csrf_cookies() -> CookieJar {
        CookieJar::parse("csrf_header_name=X-CSRFToken; csrf_cookie_name=csrftoken; csrftoken=t0k")
    }

    #[tokio::test]
    async fn csrf_header_only_on_unsafe_methods() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(HttpMethod::Get, 200, "[]")
                .reply(HttpMethod::Post, 201, "[]"),
        );
        let consumer = consumer(&transport).cookies(csrf_cookies());

        consumer.start(get("http://api.test/tags")).await;
        consumer
            .start(RequestDescriptor::new(HttpMethod::Post, "http://api.test/tags").body("[]"))
            .await;

        let sent = transport.requests();
        assert_eq!(sent[0].header("X-CSRFToken"), None);
        assert_eq!(sent[1].header("X-CSRFToken"), Some("t0k"));
        assert_eq!(sent[1].header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn existing_csrf_header_is_kept() {
        let transport = Arc::new(ScriptedTransport::new().reply(HttpMethod::Put, 200, "[]"));
        let req = RequestDescriptor::new(HttpMethod::Put, "http://api.test/tags").header("x-csrftoken", "mine");
        consumer(&transport).cookies(csrf_cookies()).start(req).await;

        let sent = transport.requests();
        let tokens: Vec<_> = sent[0]
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("x-csrftoken"))
            .collect();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].1, "mine");
    }

    #[tokio::test]
    async fn missing_csrf_cookies_do_not_fail_the_request() {
        let transport = Arc::new(ScriptedTransport::new().reply(HttpMethod::Delete, 204, ""));
        let outcome = consumer(&transport)
            .start(RequestDescriptor::new(HttpMethod::Delete, "http://api.test/tags").body("[]"))
            .await;
        assert!(outcome.is_success());
        assert_eq!(transport.requests()[0].headers.len(), 1);
    }
}
