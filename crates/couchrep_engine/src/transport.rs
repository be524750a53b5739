//! Request engine abstraction consumed by the controller.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by a [`RequestEngine`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ReplicationResult<T>> + Send + 'a>>;

/// HTTP method of a REST request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
}

impl Method {
    /// Returns the method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request addressed to the server, relative to its root.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    /// HTTP method.
    pub method: Method,
    /// Server-relative path, e.g. `/_replicate`.
    pub path: String,
    /// Extra headers.
    pub headers: BTreeMap<String, String>,
    /// JSON body.
    pub body: Option<Value>,
}

impl RestRequest {
    /// Creates a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Creates a POST request with a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    /// Adds headers to the request.
    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Self {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// A server reply: status code and parsed JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    /// HTTP status code.
    pub status: u16,
    /// Parsed body (`Null` when empty).
    pub body: Value,
}

impl RestResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Creates a 200 response.
    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes REST requests against the server.
///
/// Implementations perform the actual I/O. A submitted request is cancelled
/// by dropping its future; the controller does this by aborting the task
/// that drives it.
pub trait RequestEngine: Send + Sync + 'static {
    /// Submits a request and resolves with the server's reply.
    ///
    /// Non-2xx statuses are returned as responses, not errors. Errors are
    /// reserved for failures to obtain a reply at all.
    fn submit(&self, request: RestRequest) -> BoxFuture<'_, RestResponse>;
}

impl<E: RequestEngine + ?Sized> RequestEngine for Arc<E> {
    fn submit(&self, request: RestRequest) -> BoxFuture<'_, RestResponse> {
        (**self).submit(request)
    }
}

/// A scripted engine for testing.
///
/// Replies are queued per `(method, path)` and consumed in order. Every
/// submitted request is recorded.
#[derive(Debug, Default)]
pub struct MockEngine {
    replies: Mutex<BTreeMap<(&'static str, String), VecDeque<ReplicationResult<RestResponse>>>>,
    submitted: Mutex<Vec<RestRequest>>,
}

impl MockEngine {
    /// Creates an engine with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for `method` + `path`.
    pub fn push_reply(&self, method: Method, path: &str, reply: ReplicationResult<RestResponse>) {
        self.replies
            .lock()
            .entry((method.as_str(), path.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// Returns all requests submitted so far.
    pub fn submitted(&self) -> Vec<RestRequest> {
        self.submitted.lock().clone()
    }

    /// Counts submitted requests matching `method` + `path`.
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.submitted
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

impl RequestEngine for MockEngine {
    fn submit(&self, request: RestRequest) -> BoxFuture<'_, RestResponse> {
        let key = (request.method.as_str(), request.path.clone());
        self.submitted.lock().push(request);
        let reply = self
            .replies
            .lock()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(ReplicationError::transport_fatal(format!(
                    "no mock reply for {} {}",
                    key.0, key.1
                )))
            });
        Box::pin(async move { reply })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_engine_replays_in_order() {
        let engine = MockEngine::new();
        engine.push_reply(Method::Get, "/_active_tasks", Ok(RestResponse::ok(json!([]))));
        engine.push_reply(
            Method::Get,
            "/_active_tasks",
            Ok(RestResponse::new(500, json!({ "error": "down" }))),
        );

        let first = engine.submit(RestRequest::get("/_active_tasks")).await.unwrap();
        assert!(first.is_success());
        let second = engine.submit(RestRequest::get("/_active_tasks")).await.unwrap();
        assert!(!second.is_success());
        let third = engine.submit(RestRequest::get("/_active_tasks")).await;
        assert!(matches!(third, Err(ReplicationError::Transport { .. })));
        assert_eq!(engine.count(Method::Get, "/_active_tasks"), 3);
    }

    #[test]
    fn request_builders() {
        let mut headers = BTreeMap::new();
        headers.insert("X-A".to_string(), "1".to_string());
        let request = RestRequest::post("/_replicate", json!({})).with_headers(&headers);
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.headers.len(), 1);
        assert_eq!(Method::Get.to_string(), "GET");
    }
}
