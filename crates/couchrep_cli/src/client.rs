//! reqwest-backed HTTP client.

use couchrep_engine::{HttpClient, HttpFuture, Method};
use std::collections::BTreeMap;
use std::time::Duration;

/// [`HttpClient`] over a shared `reqwest::Client`.
pub struct ReqwestClient {
    http: reqwest::Client,
}

impl ReqwestClient {
    /// Builds a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

impl HttpClient for ReqwestClient {
    fn send(
        &self,
        method: Method,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: Option<Vec<u8>>,
    ) -> HttpFuture<'_> {
        let mut request = match method {
            Method::Get => self.http.get(url),
            Method::Post => self.http.post(url),
        };
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        Box::pin(async move {
            let response = request.send().await.map_err(|e| e.to_string())?;
            let status = response.status().as_u16();
            let bytes = response.bytes().await.map_err(|e| e.to_string())?;
            Ok((status, bytes.to_vec()))
        })
    }
}
