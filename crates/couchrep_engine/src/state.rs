//! Observable replication state.

use crate::error::ReplicationError;
use std::fmt;

/// The client's classification of the remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplicationMode {
    /// Not running: never started, stopped by the caller, finished or dropped.
    #[default]
    Stopped,
    /// Registered on the server but unable to reach the remote or authenticate.
    Offline,
    /// Continuous replication that has caught up and is waiting for changes.
    Idle,
    /// Copying changes.
    Active,
}

impl ReplicationMode {
    /// Returns true for every mode except [`ReplicationMode::Stopped`].
    pub fn is_running(self) -> bool {
        !matches!(self, ReplicationMode::Stopped)
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplicationMode::Stopped => "stopped",
            ReplicationMode::Offline => "offline",
            ReplicationMode::Idle => "idle",
            ReplicationMode::Active => "active",
        })
    }
}

/// Snapshot of everything a caller can observe about a replication.
///
/// Invariants: `running == mode.is_running()` and `completed <= total`.
/// Counters and status are zero/empty whenever `running` is false.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplicationState {
    /// Current mode.
    pub mode: ReplicationMode,
    /// True while the replication is started and not yet stopped.
    pub running: bool,
    /// True iff the most recent stop was requested by the caller.
    pub manually_stopped: bool,
    /// Server identity of the task, once the start request succeeded.
    pub remote_task_id: Option<String>,
    /// Status line from the last task record.
    pub status_text: String,
    /// Changes processed.
    pub completed: u64,
    /// Changes known to exist.
    pub total: u64,
    /// Most recent failure.
    pub last_error: Option<ReplicationError>,
}

impl ReplicationState {
    /// State of a freshly accepted replication, before any task record.
    pub fn started(task_id: String, previous_error: Option<ReplicationError>) -> Self {
        Self {
            mode: ReplicationMode::Active,
            running: true,
            manually_stopped: false,
            remote_task_id: Some(task_id),
            status_text: String::new(),
            completed: 0,
            total: 0,
            last_error: previous_error,
        }
    }

    /// Returns this state moved to `Stopped`, with counters and status cleared.
    pub fn into_stopped(self, manually: bool) -> Self {
        Self {
            mode: ReplicationMode::Stopped,
            running: false,
            manually_stopped: manually,
            status_text: String::new(),
            completed: 0,
            total: 0,
            ..self
        }
    }

    /// Fraction of work done, if the total is known.
    pub fn progress(&self) -> Option<f64> {
        (self.total > 0).then(|| self.completed as f64 / self.total as f64)
    }

    /// Checks the state invariants.
    pub fn is_consistent(&self) -> bool {
        self.running == self.mode.is_running()
            && self.completed <= self.total
            && (self.running || (self.completed == 0 && self.total == 0 && self.status_text.is_empty()))
            && !(self.running && self.manually_stopped)
    }
}
