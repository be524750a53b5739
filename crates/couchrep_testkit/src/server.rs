//! In-process simulation of a CouchDB replicator.
//!
//! [`SimulatedCouch`] answers `POST /_replicate` and `GET /_active_tasks`
//! the way a CouchDB server does, and lets a test steer what the server-side
//! tasks report.

use couchrep_engine::{
    BoxFuture, Method, ReplicationError, RequestEngine, RestRequest, RestResponse,
};
use couchrep_protocol::{ACTIVE_TASKS_PATH, REPLICATE_PATH};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// A replication task held by the simulated server.
#[derive(Debug, Clone, PartialEq)]
pub struct SimTask {
    /// Task id returned from the start request.
    pub id: String,
    /// Source endpoint URL or database name.
    pub source: String,
    /// Target endpoint URL or database name.
    pub target: String,
    /// Whether the task is continuous.
    pub continuous: bool,
    /// Changes processed.
    pub completed: i64,
    /// Changes known.
    pub total: i64,
    /// Status line override; defaults to `"Processed c / t changes"`.
    pub status: Option<String>,
    /// Error reported in the task record.
    pub error: Option<String>,
    /// Whether the task shows up in `_active_tasks`.
    pub listed: bool,
}

impl SimTask {
    fn record(&self) -> Value {
        let status = self
            .status
            .clone()
            .unwrap_or_else(|| format!("Processed {} / {} changes", self.completed, self.total));
        let mut record = json!({
            "type": "replication",
            "replication_id": self.id,
            "source": self.source,
            "target": self.target,
            "continuous": self.continuous,
            "status": status,
            "completed": self.completed,
            "total": self.total,
        });
        if let Some(error) = &self.error {
            record["error"] = json!(error);
        }
        record
    }
}

#[derive(Default)]
struct Inner {
    next_session: u64,
    tasks: BTreeMap<String, SimTask>,
    rejections: VecDeque<(u16, String)>,
    unlisted_starts: usize,
    offline: bool,
    latency: Duration,
    log: Vec<RestRequest>,
    /// Extra records listed in `_active_tasks` verbatim.
    foreign: Vec<Value>,
}

/// A scriptable stand-in for a CouchDB server.
#[derive(Default)]
pub struct SimulatedCouch {
    inner: Mutex<Inner>,
}

impl SimulatedCouch {
    /// Creates a server with no tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every reply by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Makes every request fail with a retryable transport error while set.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Rejects the next start request with `status`.
    pub fn reject_next_start(&self, status: u16, reason: impl Into<String>) {
        self.inner.lock().rejections.push_back((status, reason.into()));
    }

    /// Keeps the next started task out of `_active_tasks` until
    /// [`SimulatedCouch::list_task`] is called.
    pub fn hide_next_start(&self) {
        self.inner.lock().unlisted_starts += 1;
    }

    /// Makes a hidden task visible.
    pub fn list_task(&self, id: &str) {
        if let Some(task) = self.inner.lock().tasks.get_mut(id) {
            task.listed = true;
        }
    }

    /// Updates the counters of task `id`.
    pub fn set_progress(&self, id: &str, completed: i64, total: i64) {
        self.update(id, |task| {
            task.completed = completed;
            task.total = total;
        });
    }

    /// Overrides the status line of task `id`.
    pub fn set_status(&self, id: &str, status: Option<&str>) {
        self.update(id, |task| task.status = status.map(str::to_string));
    }

    /// Sets or clears the error of task `id`.
    pub fn set_task_error(&self, id: &str, error: Option<&str>) {
        self.update(id, |task| task.error = error.map(str::to_string));
    }

    /// Removes task `id`, as when it finishes or crashes.
    pub fn drop_task(&self, id: &str) -> Option<SimTask> {
        self.inner.lock().tasks.remove(id)
    }

    /// Lists an arbitrary record in `_active_tasks`.
    pub fn add_foreign_record(&self, record: Value) {
        self.inner.lock().foreign.push(record);
    }

    /// Returns task `id`.
    pub fn task(&self, id: &str) -> Option<SimTask> {
        self.inner.lock().tasks.get(id).cloned()
    }

    /// Returns the ids of all tasks.
    pub fn task_ids(&self) -> Vec<String> {
        self.inner.lock().tasks.keys().cloned().collect()
    }

    /// Returns every request received, in arrival order.
    pub fn requests(&self) -> Vec<RestRequest> {
        self.inner.lock().log.clone()
    }

    /// Counts received requests matching `method` + `path`.
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    /// Counts received cancel requests.
    pub fn cancel_count(&self) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|r| is_cancel(r.body.as_ref()))
            .count()
    }

    fn update(&self, id: &str, change: impl FnOnce(&mut SimTask)) {
        if let Some(task) = self.inner.lock().tasks.get_mut(id) {
            change(task);
        }
    }

    fn handle(&self, request: &RestRequest) -> Result<RestResponse, ReplicationError> {
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(ReplicationError::transport_retryable("connection refused"));
        }
        match (request.method, request.path.as_str()) {
            (Method::Get, ACTIVE_TASKS_PATH) => Ok(inner.active_tasks()),
            (Method::Post, REPLICATE_PATH) => {
                let body = request.body.clone().unwrap_or(Value::Null);
                if is_cancel(Some(&body)) {
                    Ok(inner.cancel(&body))
                } else {
                    Ok(inner.start(&body))
                }
            }
            _ => Ok(RestResponse::new(
                404,
                json!({ "error": "not_found", "reason": "missing" }),
            )),
        }
    }
}

impl Inner {
    fn start(&mut self, body: &Value) -> RestResponse {
        if let Some((status, reason)) = self.rejections.pop_front() {
            return RestResponse::new(status, json!({ "error": "rejected", "reason": reason }));
        }
        let (Some(source), Some(target)) = (endpoint(body, "source"), endpoint(body, "target"))
        else {
            return RestResponse::new(
                400,
                json!({ "error": "bad_request", "reason": "source and target required" }),
            );
        };
        let continuous = body.get("continuous").and_then(Value::as_bool) == Some(true);

        if let Some(existing) = self
            .tasks
            .values()
            .find(|t| t.source == source && t.target == target && t.continuous == continuous)
        {
            return RestResponse::ok(json!({ "ok": true, "_local_id": existing.id }));
        }

        self.next_session += 1;
        let id = if continuous {
            format!("sim-{}+continuous", self.next_session)
        } else {
            format!("sim-{}", self.next_session)
        };
        let listed = if self.unlisted_starts > 0 {
            self.unlisted_starts -= 1;
            false
        } else {
            true
        };
        self.tasks.insert(
            id.clone(),
            SimTask {
                id: id.clone(),
                source,
                target,
                continuous,
                completed: 0,
                total: 0,
                status: None,
                error: None,
                listed,
            },
        );

        if continuous {
            RestResponse::ok(json!({ "ok": true, "_local_id": id }))
        } else {
            RestResponse::ok(json!({ "ok": true, "session_id": id, "history": [] }))
        }
    }

    fn cancel(&mut self, body: &Value) -> RestResponse {
        let source = endpoint(body, "source");
        let target = endpoint(body, "target");
        let found = self
            .tasks
            .values()
            .find(|t| Some(&t.source) == source.as_ref() && Some(&t.target) == target.as_ref())
            .map(|t| t.id.clone());
        match found.and_then(|id| self.tasks.remove(&id)) {
            Some(task) => RestResponse::ok(json!({ "ok": true, "_local_id": task.id })),
            None => RestResponse::new(
                404,
                json!({ "error": "not_found", "reason": "replication not running" }),
            ),
        }
    }

    fn active_tasks(&self) -> RestResponse {
        let mut records: Vec<Value> = self
            .tasks
            .values()
            .filter(|t| t.listed)
            .map(SimTask::record)
            .collect();
        records.extend(self.foreign.iter().cloned());
        RestResponse::ok(Value::Array(records))
    }
}

fn endpoint(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("url").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn is_cancel(body: Option<&Value>) -> bool {
    body.and_then(|b| b.get("cancel")).and_then(Value::as_bool) == Some(true)
}

impl RequestEngine for SimulatedCouch {
    fn submit(&self, request: RestRequest) -> BoxFuture<'_, RestResponse> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.log.push(request.clone());
            inner.latency
        };
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.handle(&request)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(couch: &SimulatedCouch, continuous: bool) -> RestResponse {
        let body = json!({ "source": "https://r.example/db", "target": "inbox", "continuous": continuous });
        couch.handle(&RestRequest::post(REPLICATE_PATH, body)).unwrap()
    }

    #[test]
    fn start_lists_task() {
        let couch = SimulatedCouch::new();
        let reply = start(&couch, true);
        assert_eq!(reply.body["_local_id"], "sim-1+continuous");

        couch.set_progress("sim-1+continuous", 3, 7);
        let tasks = couch
            .handle(&RestRequest::get(ACTIVE_TASKS_PATH))
            .unwrap()
            .body;
        assert_eq!(tasks[0]["status"], "Processed 3 / 7 changes");
        assert_eq!(tasks[0]["continuous"], true);
    }

    #[test]
    fn one_shot_reports_session_id() {
        let couch = SimulatedCouch::new();
        assert_eq!(start(&couch, false).body["session_id"], "sim-1");
    }

    #[test]
    fn identical_start_reuses_task() {
        let couch = SimulatedCouch::new();
        start(&couch, true);
        start(&couch, true);
        assert_eq!(couch.task_ids().len(), 1);
    }

    #[test]
    fn cancel_removes_task_once() {
        let couch = SimulatedCouch::new();
        start(&couch, true);
        let cancel = RestRequest::post(
            REPLICATE_PATH,
            json!({ "source": "https://r.example/db", "target": "inbox", "continuous": true, "cancel": true }),
        );
        assert!(couch.handle(&cancel).unwrap().is_success());
        assert!(couch.task_ids().is_empty());
        assert_eq!(couch.handle(&cancel).unwrap().status, 404);
    }

    #[test]
    fn scripted_rejection_and_offline() {
        let couch = SimulatedCouch::new();
        couch.reject_next_start(500, "boom");
        assert_eq!(start(&couch, false).status, 500);
        assert!(couch.task_ids().is_empty());

        couch.set_offline(true);
        assert!(couch.handle(&RestRequest::get(ACTIVE_TASKS_PATH)).is_err());
    }
}
