//! Request bodies and response records exchanged with the server.

use crate::config::{Direction, JsonObject, ReplicationConfig};
use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};

/// Endpoint that starts and cancels replications.
pub const REPLICATE_PATH: &str = "/_replicate";

/// Endpoint that lists running server tasks.
pub const ACTIVE_TASKS_PATH: &str = "/_active_tasks";

/// Body keys owned by the controller. Extra options never override them.
pub const STRUCTURAL_KEYS: &[&str] = &[
    "source",
    "target",
    "continuous",
    "create_target",
    "filter",
    "query_params",
    "headers",
    "cancel",
];

/// Builds the `POST /_replicate` body that starts a replication.
///
/// `local` is the identifier of the local database. The remote endpoint is a
/// plain URL unless credentials are configured, in which case it becomes an
/// endpoint object carrying `auth.oauth`.
pub fn start_body(config: &ReplicationConfig, local: &str) -> Value {
    let mut body = endpoints(config, local);
    if config.create_target {
        body.insert("create_target".into(), Value::Bool(true));
    }
    if !config.headers.is_empty() {
        let headers: JsonObject = config
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), Value::String(value.clone())))
            .collect();
        body.insert("headers".into(), Value::Object(headers));
    }
    for (key, value) in &config.extra_options {
        if !STRUCTURAL_KEYS.contains(&key.as_str()) {
            body.insert(key.clone(), value.clone());
        }
    }
    Value::Object(body)
}

/// Builds the `POST /_replicate` body that cancels a replication.
///
/// Carries the same endpoints, continuity and filter as the start body so
/// the server derives the same replication identity.
pub fn stop_body(config: &ReplicationConfig, local: &str) -> Value {
    let mut body = endpoints(config, local);
    body.insert("cancel".into(), Value::Bool(true));
    Value::Object(body)
}

fn endpoints(config: &ReplicationConfig, local: &str) -> JsonObject {
    let local = Value::String(local.to_string());
    let remote = match &config.credentials {
        Some(credentials) => {
            let mut auth = Map::new();
            auth.insert("oauth".into(), credentials.to_json());
            let mut endpoint = Map::new();
            endpoint.insert("url".into(), config.remote_url().into());
            endpoint.insert("auth".into(), Value::Object(auth));
            Value::Object(endpoint)
        }
        None => Value::String(config.remote_url().to_string()),
    };
    let (source, target) = match config.direction() {
        Direction::Pull => (remote, local),
        Direction::Push => (local, remote),
    };

    let mut body = Map::new();
    body.insert("source".into(), source);
    body.insert("target".into(), target);
    body.insert("continuous".into(), Value::Bool(config.is_continuous()));
    if let Some(filter) = &config.filter {
        body.insert("filter".into(), Value::String(filter.clone()));
        if let Some(params) = &config.filter_params {
            body.insert("query_params".into(), Value::Object(params.clone()));
        }
    }
    body
}

/// Successful reply to a start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartResponse {
    /// Identifier correlating the replication with `_active_tasks` entries.
    pub task_id: String,
}

impl StartResponse {
    /// Parses the body of a 2xx `_replicate` reply.
    ///
    /// Continuous replications answer with `_local_id`, one-shot ones with
    /// `session_id`; newer servers may also send `replication_id` or `id`.
    pub fn parse(body: &Value) -> ProtocolResult<Self> {
        let object = body
            .as_object()
            .ok_or_else(|| ProtocolError::invalid_structure("start reply is not an object"))?;

        if object.get("ok").and_then(Value::as_bool) == Some(false) {
            return Err(ProtocolError::invalid_structure("start reply has ok=false"));
        }

        ["_local_id", "replication_id", "session_id", "id"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .filter(|id| !id.is_empty())
            .map(|id| Self {
                task_id: id.to_string(),
            })
            .ok_or(ProtocolError::MissingField("_local_id"))
    }
}

/// Extracts a human-readable reason from an error reply.
pub fn error_reason(body: &Value) -> String {
    let field = |name: &str| body.get(name).and_then(Value::as_str);
    match (field("error"), field("reason")) {
        (Some(error), Some(reason)) => format!("{error}: {reason}"),
        (Some(text), None) | (None, Some(text)) => text.to_string(),
        (None, None) => body.to_string(),
    }
}

/// One entry of the server's `_active_tasks` list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActiveTask {
    /// Task type, e.g. `replication`.
    pub task_type: String,
    /// Replication identity (`replication_id`, `task` or `id`).
    pub task_id: Option<String>,
    /// Free-form status line.
    pub status: Option<String>,
    /// Changes processed so far.
    pub completed: Option<i64>,
    /// Changes known to exist.
    pub total: Option<i64>,
    /// Changes the server knows are still pending.
    pub changes_pending: Option<i64>,
    /// Latest sequence seen on the source.
    pub source_seq: Option<Value>,
    /// Sequence the replicator has processed through.
    pub through_seq: Option<Value>,
    /// Whether the task is continuous, when reported.
    pub continuous: Option<bool>,
    /// Error the task is currently reporting.
    pub error: Option<String>,
}

impl ActiveTask {
    /// Builds a record from one JSON element of the task list.
    pub fn from_json(value: &Value) -> ProtocolResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::invalid_structure("task is not an object"))?;
        let text = |name: &str| object.get(name).and_then(Value::as_str).map(str::to_string);
        let int = |name: &str| {
            object
                .get(name)
                .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        };

        let task_type = text("type").ok_or(ProtocolError::MissingField("type"))?;
        let error = match object.get("error") {
            Some(Value::Null) | None => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(other) => Some(other.to_string()),
        };

        let mut task = Self {
            task_type,
            task_id: text("replication_id")
                .or_else(|| text("task"))
                .or_else(|| text("id")),
            status: text("status").or_else(|| text("status_text")),
            completed: int("completed"),
            total: int("total"),
            changes_pending: int("changes_pending"),
            source_seq: object.get("source_seq").cloned(),
            through_seq: object.get("through_seq").cloned(),
            continuous: object.get("continuous").and_then(Value::as_bool),
            error,
        };

        if task.completed.is_none() || task.total.is_none() {
            if let Some((completed, total)) = task.status.as_deref().and_then(parse_processed) {
                task.completed.get_or_insert(completed);
                task.total.get_or_insert(total);
            }
        }

        Ok(task)
    }

    /// Returns true for replication tasks.
    pub fn is_replication(&self) -> bool {
        self.task_type.eq_ignore_ascii_case("replication")
    }

    /// Returns true if this task belongs to the replication `task_id`.
    ///
    /// Older servers suffix the identity (`abc+continuous`, or
    /// `abc+continuous: src -> tgt` in the `task` field) so a prefix followed
    /// by a separator also matches.
    pub fn matches(&self, task_id: &str) -> bool {
        let Some(own) = self.task_id.as_deref() else {
            return false;
        };
        if task_id.is_empty() {
            return false;
        }
        if own == task_id {
            return true;
        }
        own.strip_prefix(task_id)
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| matches!(c, '+' | ':' | ' '))
            || task_id
                .strip_prefix(own)
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c == '+')
    }

    /// Returns true if the status or error signal a connectivity or auth problem.
    pub fn is_offline(&self) -> bool {
        self.error.is_some()
            || self
                .status
                .as_deref()
                .is_some_and(|s| s.trim_start().to_ascii_lowercase().starts_with("offline"))
    }

    /// Returns true if the status line reports an idle replicator.
    pub fn reports_idle(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("idle"))
    }

    /// Returns true if the record indicates changes still waiting to be copied.
    pub fn has_pending_work(&self) -> bool {
        if self.changes_pending.is_some_and(|n| n > 0) {
            return true;
        }
        match (&self.source_seq, &self.through_seq) {
            (Some(source), Some(through)) => source != through,
            _ => false,
        }
    }
}

/// Parses a `GET /_active_tasks` body, skipping entries that are not objects
/// or lack a type.
pub fn parse_active_tasks(body: &Value) -> ProtocolResult<Vec<ActiveTask>> {
    let entries = body
        .as_array()
        .ok_or_else(|| ProtocolError::invalid_structure("task list is not an array"))?;
    Ok(entries
        .iter()
        .filter_map(|entry| ActiveTask::from_json(entry).ok())
        .collect())
}

/// Parses `"Processed 123 / 456 changes"` into `(123, 456)`.
pub fn parse_processed(status: &str) -> Option<(i64, i64)> {
    let rest = status.trim().strip_prefix("Processed")?;
    let (completed, rest) = rest.split_once('/')?;
    let total = rest.split_whitespace().next()?;
    Some((completed.trim().parse().ok()?, total.parse().ok()?))
}
