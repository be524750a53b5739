//! Tasks command implementation.

use super::connect;
use couchrep_engine::{ActiveTask, ReplicationError, RequestEngine, RestRequest};
use couchrep_protocol::{error_reason, parse_active_tasks, ACTIVE_TASKS_PATH};
use serde::Serialize;

/// One replication task as printed.
#[derive(Debug, Serialize)]
pub struct TaskRow {
    /// Task id.
    pub id: String,
    /// Status line.
    pub status: String,
    /// Changes processed, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
    /// Changes known, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    /// Whether the task is continuous.
    pub continuous: bool,
    /// Reported error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ActiveTask> for TaskRow {
    fn from(task: &ActiveTask) -> Self {
        Self {
            id: task.task_id.clone().unwrap_or_default(),
            status: task.status.clone().unwrap_or_default(),
            completed: task.completed,
            total: task.total,
            continuous: task.continuous.unwrap_or(false),
            error: task.error.clone(),
        }
    }
}

/// Runs the tasks command.
pub async fn run(
    server: &str,
    headers: &[(String, String)],
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = connect(server, headers)?;
    let response = engine.submit(RestRequest::get(ACTIVE_TASKS_PATH)).await?;
    if !response.is_success() {
        return Err(ReplicationError::ServerRejected {
            status: response.status,
            reason: error_reason(&response.body),
        }
        .into());
    }

    let rows: Vec<TaskRow> = parse_active_tasks(&response.body)?
        .iter()
        .filter(|task| task.is_replication())
        .map(TaskRow::from)
        .collect();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            if rows.is_empty() {
                println!("No replications running");
            }
            for row in &rows {
                let counters = match (row.completed, row.total) {
                    (Some(c), Some(t)) => format!("{c}/{t}"),
                    _ => "-".to_string(),
                };
                let kind = if row.continuous { "continuous" } else { "one-shot" };
                println!("{}  {}  {}  {}", row.id, kind, counters, row.status);
                if let Some(error) = &row.error {
                    println!("    error: {error}");
                }
            }
        }
    }

    Ok(())
}
