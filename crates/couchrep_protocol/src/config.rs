//! Declarative description of a replication.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// An open JSON object used for pass-through option bags.
pub type JsonObject = Map<String, Value>;

/// Which way documents flow relative to the local database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Copy documents from the remote database into the local one.
    Pull,
    /// Copy documents from the local database to the remote one.
    Push,
}

impl Direction {
    /// Returns true for [`Direction::Pull`].
    pub fn is_pull(self) -> bool {
        matches!(self, Direction::Pull)
    }
}

/// OAuth 1.0 credentials the server-side replicator uses to reach the
/// remote database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredentials {
    /// Consumer key.
    pub consumer_key: String,
    /// Consumer secret.
    pub consumer_secret: String,
    /// Access token.
    pub token: String,
    /// Access token secret.
    pub token_secret: String,
    /// Signature method, e.g. `HMAC-SHA1`. Server default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_method: Option<String>,
}

impl OAuthCredentials {
    /// Creates credentials with the server's default signature method.
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        token: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            token: token.into(),
            token_secret: token_secret.into(),
            signature_method: None,
        }
    }

    /// Sets the signature method.
    pub fn with_signature_method(mut self, method: impl Into<String>) -> Self {
        self.signature_method = Some(method.into());
        self
    }

    /// Renders the credentials as the replicator's `oauth` object.
    pub fn to_json(&self) -> Value {
        let mut oauth = Map::new();
        oauth.insert("consumer_key".into(), self.consumer_key.clone().into());
        oauth.insert("consumer_secret".into(), self.consumer_secret.clone().into());
        oauth.insert("token".into(), self.token.clone().into());
        oauth.insert("token_secret".into(), self.token_secret.clone().into());
        if let Some(method) = &self.signature_method {
            oauth.insert("signature_method".into(), method.clone().into());
        }
        Value::Object(oauth)
    }
}

/// Parameters of a replication between a local database and a remote URL.
///
/// Direction and continuity are fixed at construction. Everything else can
/// be adjusted until the owning controller starts the replication.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationConfig {
    remote_url: String,
    direction: Direction,
    continuous: bool,
    /// Create the target database if it does not exist.
    pub create_target: bool,
    /// Server-side filter, as `"designdoc/filtername"`.
    pub filter: Option<String>,
    /// Parameters passed to the filter function.
    pub filter_params: Option<JsonObject>,
    /// Extra HTTP headers for every request belonging to this replication.
    pub headers: BTreeMap<String, String>,
    /// Credentials for the remote endpoint.
    pub credentials: Option<OAuthCredentials>,
    /// Additional replicator options merged into the start body.
    pub extra_options: JsonObject,
}

impl ReplicationConfig {
    /// Creates a configuration.
    pub fn new(remote_url: impl Into<String>, direction: Direction, continuous: bool) -> Self {
        Self {
            remote_url: remote_url.into(),
            direction,
            continuous,
            create_target: false,
            filter: None,
            filter_params: None,
            headers: BTreeMap::new(),
            credentials: None,
            extra_options: Map::new(),
        }
    }

    /// Creates a one-shot pull from `remote_url`.
    pub fn pull(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Pull, false)
    }

    /// Creates a one-shot push to `remote_url`.
    pub fn push(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Push, false)
    }

    /// Makes the replication continuous. Only available while building.
    pub fn continuous(mut self) -> Self {
        self.continuous = true;
        self
    }

    /// Sets whether the target should be created.
    pub fn with_create_target(mut self, create: bool) -> Self {
        self.create_target = create;
        self
    }

    /// Sets the filter function.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Sets the filter parameters.
    pub fn with_filter_params(mut self, params: JsonObject) -> Self {
        self.filter_params = Some(params);
        self
    }

    /// Adds an extra HTTP header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the OAuth credentials.
    pub fn with_credentials(mut self, credentials: OAuthCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Adds an extra replicator option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_options.insert(key.into(), value.into());
        self
    }

    /// Returns the remote database URL.
    pub fn remote_url(&self) -> &str {
        &self.remote_url
    }

    /// Returns the replication direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Returns true if this is a pull replication.
    pub fn is_pull(&self) -> bool {
        self.direction.is_pull()
    }

    /// Returns true if the replication keeps running after catching up.
    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// Checks that the configuration can be turned into a start request.
    pub fn validate(&self) -> ProtocolResult<()> {
        validate_remote_url(&self.remote_url)?;

        if let Some(filter) = &self.filter {
            match filter.split_once('/') {
                Some((design, name))
                    if !design.is_empty() && !name.is_empty() && !name.contains('/') => {}
                _ => {
                    return Err(ProtocolError::invalid_config(format!(
                        "filter `{filter}` is not of the form designdoc/filtername"
                    )))
                }
            }
        }

        if let Some((name, _)) = self.headers.iter().find(|(name, _)| !is_header_name(name)) {
            return Err(ProtocolError::invalid_config(format!(
                "invalid header name `{name}`"
            )));
        }

        Ok(())
    }
}

fn validate_remote_url(url: &str) -> ProtocolResult<()> {
    if url.is_empty() {
        return Err(ProtocolError::invalid_config("remote URL is required"));
    }
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            ProtocolError::invalid_config(format!("remote URL `{url}` must be absolute http(s)"))
        })?;
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = host.rsplit('@').next().unwrap_or_default();
    if host.is_empty() || host.starts_with(':') || url.chars().any(char::is_whitespace) {
        return Err(ProtocolError::invalid_config(format!(
            "remote URL `{url}` has no host"
        )));
    }
    Ok(())
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}
