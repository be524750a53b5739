//! HTTP request engine.
//!
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, etc.).

use crate::error::{ReplicationError, ReplicationResult};
use crate::transport::{BoxFuture, Method, RequestEngine, RestRequest, RestResponse};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Raw reply from an [`HttpClient`]: status code and body bytes.
pub type HttpReply = (u16, Vec<u8>);

/// Future returned by [`HttpClient::send`].
pub type HttpFuture<'a> = Pin<Box<dyn Future<Output = Result<HttpReply, String>> + Send + 'a>>;

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
pub trait HttpClient: Send + Sync + 'static {
    /// Sends a request and returns the status code and body.
    ///
    /// Errors mean no reply was received (DNS, connect, TLS, reset).
    fn send(
        &self,
        method: Method,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> HttpFuture<'_>;
}

/// JSON-over-HTTP request engine rooted at a server URL.
pub struct HttpEngine<C: HttpClient> {
    /// Base URL of the server (e.g., "http://127.0.0.1:5984").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Headers sent with every request.
    default_headers: BTreeMap<String, String>,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpEngine<C> {
    /// Creates a new HTTP engine.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            default_headers: BTreeMap::new(),
            last_error: RwLock::new(None),
        }
    }

    /// Adds a header sent with every request.
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Joins a server-relative path onto the base URL.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn execute(&self, request: RestRequest) -> ReplicationResult<RestResponse> {
        let url = self.url_for(&request.path);

        let mut headers = self.default_headers.clone();
        headers.insert("Accept".into(), "application/json".into());
        let body = match &request.body {
            Some(body) => {
                headers.insert("Content-Type".into(), "application/json".into());
                Some(serde_json::to_vec(body).map_err(|e| {
                    ReplicationError::Protocol(format!("failed to encode request: {e}"))
                })?)
            }
            None => None,
        };
        headers.extend(request.headers);

        debug!(method = %request.method, %url, "sending request");
        let (status, bytes) = self
            .client
            .send(request.method, &url, &headers, body)
            .await
            .map_err(|e| {
                *self.last_error.write() = Some(e.clone());
                ReplicationError::transport_retryable(e)
            })?;
        *self.last_error.write() = None;

        let body = if bytes.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(body) => body,
                // Error pages from proxies are often HTML; keep the status.
                Err(_) if !(200..300).contains(&status) => {
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                Err(e) => {
                    return Err(ReplicationError::Protocol(format!(
                        "failed to decode response: {e}"
                    )))
                }
            }
        };
        debug!(method = %request.method, %url, status, "received response");
        Ok(RestResponse::new(status, body))
    }
}

impl<C: HttpClient> RequestEngine for HttpEngine<C> {
    fn submit(&self, request: RestRequest) -> BoxFuture<'_, RestResponse> {
        Box::pin(self.execute(request))
    }
}
